use nightjar_cdp::mock;
use serde_json::json;

use crate::harness::{attached_session, exception_pause};

#[tokio::test]
async fn exceptions_raised_inside_adapter_scripts_are_resumed() {
    let (runtime, mut client) = attached_session().await;
    client
        .ok("setExceptionBreakpoints", json!({ "filters": ["all"] }))
        .await;

    let mut pause = exception_pause("err-internal", "getter threw", false);
    pause["callFrames"] = json!([
        mock::call_frame("cf-a", "get description", "file:///app/main.js", 7),
        mock::call_frame("cf-b", "", "nightjar-internal.js", 1),
    ]);
    runtime.pause(None, pause);
    runtime.wait_for_command(None, "Debugger.resume").await.unwrap();
    client.assert_no_event("stopped").await;
    assert!(runtime.commands_for(None, "Runtime.callFunctionOn").is_empty());

    runtime.pause(None, exception_pause("err-user", "real", false));
    client.wait_for_stopped_reason("exception").await;
    client.disconnect().await;
}
