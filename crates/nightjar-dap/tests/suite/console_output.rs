use nightjar_cdp::mock::MockReply;
use serde_json::json;

use crate::harness::{attached_session, is_event};

#[tokio::test]
async fn console_calls_become_output_events_in_order() {
    let (runtime, mut client) = attached_session().await;
    runtime.respond_with("Runtime.callFunctionOn", |cmd| {
        if cmd.params["objectId"] == "point" {
            MockReply::Result(json!({ "result": { "type": "string", "value": "Point(1, 2)" } }))
        } else {
            MockReply::Result(json!({ "result": { "type": "undefined" } }))
        }
    });

    runtime.emit(
        None,
        "Runtime.consoleAPICalled",
        json!({
            "type": "log",
            "executionContextId": 1,
            "args": [
                { "type": "string", "value": "at" },
                { "type": "object", "className": "Point", "description": "Point", "objectId": "point" },
            ],
        }),
    );
    runtime.emit(
        None,
        "Runtime.consoleAPICalled",
        json!({
            "type": "error",
            "executionContextId": 1,
            "args": [{ "type": "number", "value": 42, "description": "42" }],
        }),
    );

    let first = client.wait_for(|msg| is_event(msg, "output")).await;
    assert_eq!(first["body"]["category"], "stdout");
    assert_eq!(first["body"]["output"], "at Point(1, 2)\n");
    let second = client.wait_for(|msg| is_event(msg, "output")).await;
    assert_eq!(second["body"]["category"], "stderr");
    assert_eq!(second["body"]["output"], "42\n");
    client.disconnect().await;
}
