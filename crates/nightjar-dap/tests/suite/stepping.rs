use nightjar_cdp::mock::{self, MockReply};
use serde_json::json;

use crate::harness::{attached_session, debugger_statement, is_event};

#[tokio::test]
async fn debugger_statement_stops_with_a_mapped_stack() {
    let (runtime, mut client) = attached_session().await;
    runtime.pause(None, debugger_statement());

    let stopped = client.wait_for_stopped_reason("debugger statement").await;
    assert_eq!(stopped["threadId"], 1);
    assert_eq!(stopped["allThreadsStopped"], false);

    let frames = client.stack_trace(1).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["name"], "handler");
    assert_eq!(frames[0]["line"], 3);
    assert_eq!(frames[0]["source"]["path"], "/app/main.js");
    assert_eq!(frames[0]["source"]["name"], "main.js");
    assert_eq!(frames[1]["name"], "<anonymous>");

    let paged = client
        .ok("stackTrace", json!({ "threadId": 1, "startFrame": 1, "levels": 1 }))
        .await;
    assert_eq!(paged["totalFrames"], 2);
    assert_eq!(paged["stackFrames"][0]["id"], frames[1]["id"]);
    client.disconnect().await;
}

#[tokio::test]
async fn each_step_yields_one_continued_then_one_stopped() {
    let (runtime, mut client) = attached_session().await;
    runtime.pause(None, debugger_statement());
    client.wait_for_stopped_reason("debugger statement").await;

    for (command, method) in [
        ("next", "Debugger.stepOver"),
        ("stepIn", "Debugger.stepInto"),
        ("stepOut", "Debugger.stepOut"),
    ] {
        runtime.queue_pause(None, mock::paused("other", vec![mock::call_frame("cf-s", "f", "file:///app/main.js", 4)]));
        client.ok(command, json!({ "threadId": 1 })).await;
        runtime.wait_for_command(None, method).await.unwrap();

        let events = client.drain_events().await;
        let names: Vec<&str> = events
            .iter()
            .filter(|msg| is_event(msg, "continued") || is_event(msg, "stopped"))
            .map(|msg| msg["event"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["continued", "stopped"], "{command}");
        let stopped = events.iter().find(|msg| is_event(msg, "stopped")).unwrap();
        assert_eq!(stopped["body"]["reason"], "step", "{command}");
    }

    let step_in = runtime.commands_for(None, "Debugger.stepInto");
    assert_eq!(step_in[0].params["breakOnAsyncCall"], true);
    client.disconnect().await;
}

#[tokio::test]
async fn continue_and_pause_round_trip() {
    let (runtime, mut client) = attached_session().await;
    runtime.pause(None, debugger_statement());
    client.wait_for_stopped_reason("debugger statement").await;

    let body = client.ok("continue", json!({ "threadId": 1 })).await;
    assert_eq!(body["allThreadsContinued"], false);
    let continued = client.wait_for_event("continued").await;
    assert_eq!(continued["body"]["threadId"], 1);
    client.assert_no_event("stopped").await;

    client.ok("pause", json!({ "threadId": 1 })).await;
    client.wait_for_stopped_reason("pause").await;

    let message = client.fails("pause", json!({ "threadId": 1 })).await;
    assert_eq!(message, "cannot pause thread 1 while it is paused");
    client.disconnect().await;
}

#[tokio::test]
async fn frames_are_invalid_after_resuming() {
    let (runtime, mut client) = attached_session().await;
    runtime.pause(None, debugger_statement());
    client.wait_for_stopped_reason("debugger statement").await;
    let frames = client.stack_trace(1).await;
    let frame_id = frames[0]["id"].as_i64().unwrap();

    runtime.respond_with("Debugger.evaluateOnCallFrame", |cmd| {
        assert_eq!(cmd.params["callFrameId"], "cf-1");
        MockReply::Result(json!({ "result": { "type": "number", "value": 3, "description": "3" } }))
    });
    let body = client
        .ok("evaluate", json!({ "expression": "1 + 2", "frameId": frame_id }))
        .await;
    assert_eq!(body["result"], "3");
    assert_eq!(body["type"], "number");

    client.ok("continue", json!({ "threadId": 1 })).await;
    client.wait_for_event("continued").await;
    let message = client
        .fails("evaluate", json!({ "expression": "1 + 2", "frameId": frame_id }))
        .await;
    assert_eq!(message, format!("unknown frame {frame_id}"));
    client.disconnect().await;
}

#[tokio::test]
async fn evaluation_errors_are_reported_as_failures() {
    let (runtime, mut client) = attached_session().await;
    runtime.respond_with("Runtime.evaluate", |_| {
        MockReply::Result(json!({
            "result": { "type": "object", "subtype": "error", "description": "ReferenceError: nope is not defined" },
            "exceptionDetails": {
                "exceptionId": 1,
                "text": "Uncaught",
                "lineNumber": 0,
                "columnNumber": 0,
                "exception": { "type": "object", "description": "ReferenceError: nope is not defined" },
            },
        }))
    });
    let message = client.fails("evaluate", json!({ "expression": "nope" })).await;
    assert_eq!(message, "ReferenceError: nope is not defined");
    client.disconnect().await;
}

#[tokio::test]
async fn break_on_start_surfaces_as_entry() {
    let (runtime, mut client) = attached_session().await;
    runtime.pause(
        None,
        mock::paused("Break on start", vec![mock::call_frame("cf-0", "", "file:///app/main.js", 0)]),
    );
    let stopped = client.wait_for_stopped_reason("entry").await;
    assert_eq!(stopped["threadId"], 1);
    client.disconnect().await;
}

#[tokio::test]
async fn pause_interrupts_a_step_that_keeps_running() {
    let (runtime, mut client) = attached_session().await;
    runtime.pause(None, debugger_statement());
    client.wait_for_stopped_reason("debugger statement").await;

    // Nothing is queued, so the stepped-over call never returns.
    client.ok("next", json!({ "threadId": 1 })).await;
    client.wait_for_event("continued").await;
    client.assert_no_event("stopped").await;

    client.ok("pause", json!({ "threadId": 1 })).await;
    let stopped = client.wait_for_stopped_reason("pause").await;
    assert_eq!(stopped["threadId"], 1);
    client.disconnect().await;
}

/// An exception pause `extra` frames below the two-frame `debugger_statement`.
fn caught_exception_below(extra: usize) -> serde_json::Value {
    let mut frames: Vec<_> = (0..extra)
        .map(|i| mock::call_frame(&format!("cf-deep-{i}"), "inner", "file:///app/lib.js", i as u32))
        .collect();
    frames.push(mock::call_frame("cf-1", "handler", "file:///app/main.js", 2));
    frames.push(mock::call_frame("cf-2", "", "file:///app/main.js", 10));
    let mut pause = mock::paused("exception", frames);
    pause["data"] = json!({
        "type": "object",
        "className": "Error",
        "description": "Error: handled",
        "objectId": "caught-1",
        "uncaught": false,
    });
    pause
}

#[tokio::test]
async fn skipped_exception_inside_a_step_over_carries_the_step_on() {
    let (runtime, mut client) = attached_session().await;
    client
        .ok("setExceptionBreakpoints", json!({ "filters": ["uncaught"] }))
        .await;
    runtime.pause(None, debugger_statement());
    client.wait_for_stopped_reason("debugger statement").await;

    // Thrown two calls below `handler` and caught there.
    runtime.queue_pause(None, caught_exception_below(2));
    // First step out lands one call below `handler`, the second back in it.
    runtime.queue_pause(
        None,
        mock::paused(
            "other",
            vec![
                mock::call_frame("cf-mid", "inner", "file:///app/lib.js", 7),
                mock::call_frame("cf-1", "handler", "file:///app/main.js", 2),
                mock::call_frame("cf-2", "", "file:///app/main.js", 10),
            ],
        ),
    );
    runtime.queue_pause(
        None,
        mock::paused(
            "other",
            vec![
                mock::call_frame("cf-3", "handler", "file:///app/main.js", 3),
                mock::call_frame("cf-2", "", "file:///app/main.js", 10),
            ],
        ),
    );

    client.ok("next", json!({ "threadId": 1 })).await;
    runtime
        .wait_for_commands(None, "Debugger.stepOut", 2)
        .await
        .expect("step was not carried out of the callee");

    let events = client.drain_events().await;
    let names: Vec<&str> = events
        .iter()
        .filter(|msg| is_event(msg, "continued") || is_event(msg, "stopped"))
        .map(|msg| msg["event"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["continued", "stopped"]);
    let stopped = events.iter().find(|msg| is_event(msg, "stopped")).unwrap();
    assert_eq!(stopped["body"]["reason"], "step");
    assert!(runtime.commands_for(None, "Debugger.resume").is_empty());

    let frames = client.stack_trace(1).await;
    assert_eq!(frames[0]["line"], 4);
    client.disconnect().await;
}

#[tokio::test]
async fn skipped_exception_in_the_stepped_frame_steps_again() {
    let (runtime, mut client) = attached_session().await;
    client
        .ok("setExceptionBreakpoints", json!({ "filters": ["uncaught"] }))
        .await;
    runtime.pause(None, debugger_statement());
    client.wait_for_stopped_reason("debugger statement").await;

    runtime.queue_pause(None, caught_exception_below(0));
    runtime.queue_pause(
        None,
        mock::paused(
            "other",
            vec![
                mock::call_frame("cf-3", "handler", "file:///app/main.js", 5),
                mock::call_frame("cf-2", "", "file:///app/main.js", 10),
            ],
        ),
    );

    client.ok("next", json!({ "threadId": 1 })).await;
    client.wait_for_event("continued").await;
    client.wait_for_stopped_reason("step").await;

    assert_eq!(runtime.commands_for(None, "Debugger.stepOver").len(), 2);
    assert!(runtime.commands_for(None, "Debugger.stepOut").is_empty());
    assert!(runtime.commands_for(None, "Debugger.resume").is_empty());
    client.disconnect().await;
}
