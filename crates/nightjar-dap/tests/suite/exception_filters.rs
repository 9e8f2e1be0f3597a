use serde_json::json;

use crate::harness::{attached_session, exception_pause, spawn_wire_server, attach_to};
use nightjar_cdp::mock::MockRuntime;

#[tokio::test]
async fn filters_select_the_runtime_pause_state() {
    let (runtime, mut client) = attached_session().await;

    for (filters, state) in [
        (json!(["uncaught"]), "uncaught"),
        (json!(["all", "uncaught"]), "all"),
        (json!([]), "none"),
    ] {
        let body = client
            .ok("setExceptionBreakpoints", json!({ "filters": filters }))
            .await;
        let verified: Vec<bool> = body["breakpoints"]
            .as_array()
            .unwrap()
            .iter()
            .map(|bp| bp["verified"].as_bool().unwrap())
            .collect();
        assert!(verified.iter().all(|v| *v), "{body}");

        let sent = runtime.commands_for(None, "Debugger.setPauseOnExceptions");
        assert_eq!(sent.last().unwrap().params["state"], state);
    }
    client.disconnect().await;
}

#[tokio::test]
async fn unknown_filter_ids_are_not_verified() {
    let (_runtime, mut client) = attached_session().await;
    let body = client
        .ok("setExceptionBreakpoints", json!({ "filters": ["uncaught", "promises"] }))
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], true);
    assert_eq!(body["breakpoints"][1]["verified"], false);
    client.disconnect().await;
}

#[tokio::test]
async fn uncaught_filter_skips_caught_exceptions() {
    let (runtime, mut client) = attached_session().await;
    client
        .ok("setExceptionBreakpoints", json!({ "filters": ["uncaught"] }))
        .await;

    runtime.pause(None, exception_pause("caught-1", "handled", false));
    runtime.wait_for_command(None, "Debugger.resume").await.unwrap();
    client.assert_no_event("stopped").await;

    runtime.pause(None, exception_pause("uncaught-1", "boom", true));
    let stopped = client.wait_for_stopped_reason("exception").await;
    assert_eq!(stopped["description"], "Paused on exception");
    assert!(stopped["text"].as_str().unwrap().starts_with("Error: boom"));

    let info = client.ok("exceptionInfo", json!({ "threadId": 1 })).await;
    assert_eq!(info["exceptionId"], "Error");
    assert_eq!(info["breakMode"], "unhandled");
    assert_eq!(info["details"]["message"], "boom");
    assert_eq!(info["details"]["typeName"], "Error");
    client.disconnect().await;
}

#[tokio::test]
async fn all_filter_pauses_on_caught_exceptions() {
    let (runtime, mut client) = attached_session().await;
    client
        .ok("setExceptionBreakpoints", json!({ "filters": ["all"] }))
        .await;

    runtime.pause(None, exception_pause("caught-1", "handled", false));
    client.wait_for_stopped_reason("exception").await;
    let info = client.ok("exceptionInfo", json!({ "threadId": 1 })).await;
    assert_eq!(info["breakMode"], "always");
    client.disconnect().await;
}

#[tokio::test]
async fn exception_pauses_without_filters_never_reach_the_client() {
    let (runtime, mut client) = attached_session().await;
    runtime.pause(None, exception_pause("e-1", "late", true));
    runtime.wait_for_command(None, "Debugger.resume").await.unwrap();
    client.assert_no_event("stopped").await;
    client.disconnect().await;
}

#[tokio::test]
async fn filters_set_before_attach_apply_to_the_root_context() {
    let runtime = MockRuntime::spawn().await.unwrap();
    let mut client = spawn_wire_server();
    client.initialize_handshake().await;
    client
        .ok("setExceptionBreakpoints", json!({ "filters": ["uncaught"] }))
        .await;
    let resp = client.attach(runtime.addr().port()).await;
    assert_eq!(resp["success"], true, "{resp}");

    let sent = runtime.commands_for(None, "Debugger.setPauseOnExceptions");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].params["state"], "uncaught");
    client.disconnect().await;
}

#[tokio::test]
async fn uncaught_errors_are_echoed_to_stderr() {
    let runtime = MockRuntime::spawn().await.unwrap();
    let mut client = attach_to(&runtime, spawn_wire_server()).await;
    runtime.emit(
        None,
        "Runtime.exceptionThrown",
        json!({
            "timestamp": 0,
            "exceptionDetails": {
                "exceptionId": 4,
                "text": "Uncaught",
                "lineNumber": 0,
                "columnNumber": 0,
                "exception": { "type": "object", "description": "TypeError: x is not a function" },
            },
        }),
    );
    let output = client
        .wait_for(|msg| crate::harness::is_event(msg, "output") && msg["body"]["category"] == "stderr")
        .await;
    assert_eq!(output["body"]["output"], "Uncaught TypeError: x is not a function\n");
    client.disconnect().await;
}
