use serde_json::json;

use crate::harness::{attached_session, spawn_wire_server};

#[tokio::test]
async fn threads_lists_the_main_context() {
    let (_runtime, mut client) = attached_session().await;
    assert_eq!(client.threads().await, vec![(1, "Main".to_string())]);
    client.disconnect().await;
}

#[tokio::test]
async fn stack_trace_of_a_running_thread_is_rejected() {
    let (_runtime, mut client) = attached_session().await;
    let message = client.fails("stackTrace", json!({ "threadId": 1 })).await;
    assert_eq!(message, "thread 1 is not paused");

    let message = client.fails("exceptionInfo", json!({ "threadId": 1 })).await;
    assert_eq!(message, "thread 1 is not paused");
    client.disconnect().await;
}

#[tokio::test]
async fn unknown_threads_are_rejected() {
    let (_runtime, mut client) = attached_session().await;
    for command in ["next", "continue", "pause", "stackTrace"] {
        let message = client.fails(command, json!({ "threadId": 99 })).await;
        assert_eq!(message, "unknown thread 99", "{command}");
    }
    let message = client.fails("next", json!({})).await;
    assert_eq!(message, "next.threadId is required");
    client.disconnect().await;
}

#[tokio::test]
async fn steps_on_a_running_thread_are_invalid() {
    let (runtime, mut client) = attached_session().await;
    let message = client.fails("next", json!({ "threadId": 1 })).await;
    assert_eq!(message, "cannot step over thread 1 while it is running");
    let message = client.fails("stepIn", json!({ "threadId": 1 })).await;
    assert_eq!(message, "cannot step into thread 1 while it is running");
    assert!(runtime.commands_for(None, "Debugger.stepOver").is_empty());
    assert!(runtime.commands_for(None, "Debugger.stepInto").is_empty());
    client.disconnect().await;
}

#[tokio::test]
async fn requests_before_attach_report_the_missing_connection() {
    let mut client = spawn_wire_server();
    let caps = client.initialize_handshake().await;
    assert_eq!(caps["supportsExceptionInfoRequest"], true);
    assert_eq!(caps["supportsConfigurationDoneRequest"], true);

    assert_eq!(client.threads().await, Vec::new());
    let message = client.fails("continue", json!({ "threadId": 1 })).await;
    assert_eq!(message, "not attached");
    client.disconnect().await;
}

#[tokio::test]
async fn unknown_requests_fail() {
    let mut client = spawn_wire_server();
    client.initialize_handshake().await;
    let message = client.fails("restartFrame", json!({ "frameId": 1 })).await;
    assert_eq!(message, "unsupported request restartFrame");
    client.disconnect().await;
}
