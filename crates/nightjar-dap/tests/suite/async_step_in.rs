use nightjar_cdp::{mock, mock::MockRuntime, SessionId};
use serde_json::{json, Value};

use crate::harness::{attached_session, debugger_statement, is_event, DapClient};

fn scheduling_pause(token: &str) -> Value {
    let mut pause = mock::paused(
        "other",
        vec![mock::call_frame("cf-sched", "schedule", "file:///app/main.js", 12)],
    );
    pause["asyncCallStackTraceId"] = json!({ "id": token, "debuggerId": "d" });
    pause
}

fn scheduled_pause(frame: &str, url: &str, token: &str) -> Value {
    let mut pause = mock::paused("other", vec![mock::call_frame(frame, "onMessage", url, 0)]);
    pause["asyncStackTraceId"] = json!({ "id": token, "debuggerId": "d" });
    pause
}

async fn with_worker() -> (MockRuntime, DapClient, SessionId) {
    let (runtime, client) = attached_session().await;
    let worker = SessionId::new("worker-1");
    runtime.attach_target(&worker, "worker", "worker.js", true);
    runtime
        .wait_for_command(Some(&worker), "Runtime.runIfWaitingForDebugger")
        .await
        .unwrap();
    (runtime, client, worker)
}

/// Stop the main thread and step into a call that schedules async work
/// under `token`.
async fn step_into_scheduling_call(runtime: &MockRuntime, client: &mut DapClient, token: &str) {
    runtime.pause(None, debugger_statement());
    client.wait_for_stopped_reason("debugger statement").await;

    runtime.queue_pause(None, scheduling_pause(token));
    client.ok("stepIn", json!({ "threadId": 1 })).await;
    runtime
        .wait_for_command(None, "Debugger.pauseOnAsyncCall")
        .await
        .unwrap();
    // The scheduling pause itself is resumed without a stop.
    runtime.wait_for_command(None, "Debugger.resume").await.unwrap();
}

#[tokio::test]
async fn step_in_follows_async_work_into_another_thread() {
    let (runtime, mut client, worker) = with_worker().await;
    step_into_scheduling_call(&runtime, &mut client, "41").await;

    let armed = runtime
        .wait_for_command(Some(&worker), "Debugger.pauseOnAsyncCall")
        .await
        .unwrap();
    assert_eq!(armed.params["parentStackTraceId"]["id"], "41");

    runtime.pause(Some(&worker), scheduled_pause("w-1", "file:///app/worker.js", "41"));
    let stopped = client.wait_for_stopped_reason("step").await;
    assert_eq!(stopped["threadId"], 2);

    // Thread 1 saw exactly one continued and no further stop.
    let events = client.drain_events().await;
    assert!(!events.iter().any(|msg| is_event(msg, "stopped")), "{events:?}");
    client.disconnect().await;
}

#[tokio::test]
async fn unrelated_async_tasks_are_skipped_while_waiting() {
    let (runtime, mut client, worker) = with_worker().await;
    step_into_scheduling_call(&runtime, &mut client, "41").await;

    // Another task, scheduled elsewhere, starts first.
    runtime.pause(Some(&worker), scheduled_pause("w-0", "file:///app/worker.js", "7"));
    runtime
        .wait_for_command(Some(&worker), "Debugger.resume")
        .await
        .unwrap();
    client.assert_no_event("stopped").await;

    runtime.pause(Some(&worker), scheduled_pause("w-1", "file:///app/worker.js", "41"));
    let stopped = client.wait_for_stopped_reason("step").await;
    assert_eq!(stopped["threadId"], 2);
    client.disconnect().await;
}

#[tokio::test]
async fn tasks_matching_a_finished_step_are_skipped() {
    let (runtime, mut client, worker) = with_worker().await;
    step_into_scheduling_call(&runtime, &mut client, "41").await;
    runtime.pause(Some(&worker), scheduled_pause("w-1", "file:///app/worker.js", "41"));
    client.wait_for_stopped_reason("step").await;
    client.ok("continue", json!({ "threadId": 2 })).await;
    client.wait_for_event("continued").await;

    // The same scheduled call firing again (e.g. a repeating timer) is not a
    // step target any more.
    runtime.pause(Some(&worker), scheduled_pause("w-2", "file:///app/worker.js", "41"));
    runtime
        .wait_for_commands(Some(&worker), "Debugger.resume", 2)
        .await
        .unwrap();
    client.assert_no_event("stopped").await;
    client.disconnect().await;
}

#[tokio::test]
async fn breakpoints_still_stop_while_a_handoff_is_pending() {
    let (runtime, mut client, worker) = with_worker().await;
    step_into_scheduling_call(&runtime, &mut client, "41").await;

    let mut hit = scheduled_pause("w-0", "file:///app/worker.js", "7");
    hit["hitBreakpoints"] = json!(["bp-1"]);
    runtime.pause(Some(&worker), hit);
    let stopped = client.wait_for_stopped_reason("breakpoint").await;
    assert_eq!(stopped["threadId"], 2);

    // The surfaced stop ends the pending handoff.
    runtime.pause(None, scheduled_pause("m-1", "file:///app/main.js", "41"));
    runtime.wait_for_commands(None, "Debugger.resume", 2).await.unwrap();
    client.assert_no_event("stopped").await;
    client.disconnect().await;
}

#[tokio::test]
async fn workers_created_during_a_handoff_are_armed_before_release() {
    let (runtime, mut client) = attached_session().await;
    step_into_scheduling_call(&runtime, &mut client, "41").await;

    let late = SessionId::new("late");
    runtime.attach_target(&late, "worker", "late.js", true);
    runtime
        .wait_for_command(Some(&late), "Runtime.runIfWaitingForDebugger")
        .await
        .unwrap();

    let methods: Vec<String> = runtime
        .commands()
        .into_iter()
        .filter(|cmd| cmd.session_id.as_ref() == Some(&late))
        .map(|cmd| cmd.method)
        .collect();
    let armed = methods
        .iter()
        .position(|m| m == "Debugger.pauseOnAsyncCall")
        .expect("late worker was never armed");
    let released = methods
        .iter()
        .position(|m| m == "Runtime.runIfWaitingForDebugger")
        .unwrap();
    assert!(armed < released, "{methods:?}");

    runtime.pause(Some(&late), scheduled_pause("l-1", "file:///app/late.js", "41"));
    let stopped = client.wait_for_stopped_reason("step").await;
    assert_eq!(stopped["threadId"], 2);
    client.disconnect().await;
}
