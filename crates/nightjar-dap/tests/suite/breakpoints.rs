use serde_json::json;

use nightjar_cdp::mock::{self, MockRuntime};

use crate::harness::{attach_to, attached_session, is_event, spawn_wire_server};

#[tokio::test]
async fn breakpoints_set_before_attach_are_installed_on_attach() {
    let runtime = MockRuntime::spawn().await.unwrap();
    let mut client = spawn_wire_server();
    client.initialize_handshake().await;
    let body = client
        .ok(
            "setBreakpoints",
            json!({
                "source": { "path": "/app/main.js" },
                "breakpoints": [{ "line": 10 }, { "line": 12, "condition": "count > 2" }],
            }),
        )
        .await;
    let breakpoints = body["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints.len(), 2);
    assert!(breakpoints.iter().all(|bp| bp["verified"] == true));

    let mut client = attach_to(&runtime, client).await;
    let installed = runtime.commands_for(None, "Debugger.setBreakpointByUrl");
    assert_eq!(installed.len(), 2);
    assert_eq!(installed[0].params["url"], "file:///app/main.js");
    assert_eq!(installed[0].params["lineNumber"], 9);
    assert_eq!(installed[1].params["condition"], "count > 2");
    client.disconnect().await;
}

#[tokio::test]
async fn malformed_breakpoint_conditions_are_reported() {
    let (runtime, mut client) = attached_session().await;
    let body = client
        .ok(
            "setBreakpoints",
            json!({
                "source": { "path": "/app/main.js" },
                "breakpoints": [{ "line": 5, "condition": "a ===" }, { "line": 6 }],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], false);
    assert!(body["breakpoints"][0]["message"].is_string());
    assert_eq!(body["breakpoints"][1]["verified"], true);

    let diagnostic = client
        .wait_for(|msg| is_event(msg, "output") && msg["body"]["category"] == "stderr")
        .await;
    let text = diagnostic["body"]["output"].as_str().unwrap();
    assert!(text.starts_with("file:///app/main.js:5: breakpoint not set. "), "{text}");

    let installed = runtime.commands_for(None, "Debugger.setBreakpointByUrl");
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].params["lineNumber"], 5);
    client.disconnect().await;
}

#[tokio::test]
async fn hitting_a_breakpoint_reports_breakpoint() {
    let (runtime, mut client) = attached_session().await;
    client
        .ok(
            "setBreakpoints",
            json!({ "source": { "path": "/app/main.js" }, "breakpoints": [{ "line": 3 }] }),
        )
        .await;

    let mut pause = mock::paused("other", vec![mock::call_frame("cf-1", "handler", "file:///app/main.js", 2)]);
    pause["hitBreakpoints"] = json!(["bp-1"]);
    runtime.pause(None, pause);
    let stopped = client.wait_for_stopped_reason("breakpoint").await;
    assert_eq!(stopped["threadId"], 1);
    client.disconnect().await;
}

#[tokio::test]
async fn replacing_breakpoints_removes_the_old_ones() {
    let (runtime, mut client) = attached_session().await;
    let source = json!({ "path": "/app/main.js" });
    client
        .ok("setBreakpoints", json!({ "source": source, "breakpoints": [{ "line": 3 }] }))
        .await;
    client
        .ok("setBreakpoints", json!({ "source": source, "breakpoints": [] }))
        .await;

    let removed = runtime.commands_for(None, "Debugger.removeBreakpoint");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].params["breakpointId"], "bp-1");
    client.disconnect().await;
}
