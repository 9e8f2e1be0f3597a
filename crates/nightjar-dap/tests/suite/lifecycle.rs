use nightjar_cdp::SessionId;

use crate::harness::{attached_session, is_event, spawn_wire_server};

#[tokio::test]
async fn runtime_exit_ends_the_session() {
    let (runtime, mut client) = attached_session().await;
    let worker = SessionId::new("worker-1");
    runtime.attach_target(&worker, "worker", "w.js", true);
    runtime
        .wait_for_command(Some(&worker), "Runtime.runIfWaitingForDebugger")
        .await
        .unwrap();

    runtime.close();
    client.wait_for_event("terminated").await;
    client.disconnect().await;
}

#[tokio::test]
async fn runtime_exit_reports_every_thread_exit_first() {
    let (runtime, mut client) = attached_session().await;
    runtime.close();

    let mut exited = Vec::new();
    loop {
        let msg = client
            .wait_for(|msg| is_event(msg, "thread") || is_event(msg, "terminated"))
            .await;
        if is_event(&msg, "terminated") {
            break;
        }
        if msg["body"]["reason"] == "exited" {
            exited.push(msg["body"]["threadId"].as_i64().unwrap());
        }
    }
    assert_eq!(exited, vec![1]);
    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_terminates_an_attached_session() {
    let (runtime, client) = attached_session().await;
    let events = client.disconnect().await;
    assert!(events.iter().any(|msg| is_event(msg, "terminated")), "{events:?}");
    drop(runtime);
}

#[tokio::test]
async fn disconnect_without_attach_still_terminates() {
    let mut client = spawn_wire_server();
    client.initialize_handshake().await;
    let events = client.disconnect().await;
    assert!(events.iter().any(|msg| is_event(msg, "terminated")), "{events:?}");
}
