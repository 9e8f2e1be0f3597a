//! Forwarding of `console.*` calls to client output events.
//!
//! Calls are forwarded by a single task so output keeps the order the runtime
//! produced it in, even when describing an argument needs a round trip.

use nightjar_cdp::{CdpSession, ConsoleApiCalled, RemoteObject};
use tokio::sync::mpsc;

use crate::{
    events::{AdapterEvent, EventSink, OutputCategory},
    internal::mark_internal,
};

/// Runs with the value as `this`. A user-defined description that throws must
/// not escape into the debuggee's exception handling.
const DESCRIBE: &str = "function() {
  try {
    const describe = this[Symbol.for('debug.description')];
    if (typeof describe === 'function') {
      return String(describe.call(this));
    }
  } catch (e) {}
  return undefined;
}";

pub struct ConsoleCall {
    pub session: CdpSession,
    pub call: ConsoleApiCalled,
}

pub type ConsoleSink = mpsc::UnboundedSender<ConsoleCall>;

pub fn spawn_console_forwarder(events: EventSink) -> ConsoleSink {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConsoleCall>();
    tokio::spawn(async move {
        while let Some(ConsoleCall { session, call }) = rx.recv().await {
            let output = render(&session, &call).await;
            let _ = events.send(AdapterEvent::output(category(&call.kind), output));
        }
    });
    tx
}

pub fn category(kind: &str) -> OutputCategory {
    match kind {
        "error" | "warning" | "assert" | "trace" => OutputCategory::Stderr,
        _ => OutputCategory::Stdout,
    }
}

async fn render(session: &CdpSession, call: &ConsoleApiCalled) -> String {
    let mut parts = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        parts.push(describe(session, arg).await);
    }
    let mut line = parts.join(" ");
    line.push('\n');
    line
}

/// Text for one console argument, preferring the value's own description hook.
pub async fn describe(session: &CdpSession, value: &RemoteObject) -> String {
    let Some(object_id) = &value.object_id else {
        return value.display();
    };
    match session
        .call_function_on(object_id, &mark_internal(DESCRIBE), Vec::new(), true, true)
        .await
    {
        Ok(result) => match result.result.value {
            Some(serde_json::Value::String(text)) => text,
            _ => value.display(),
        },
        Err(err) => {
            tracing::debug!(target: "nightjar.dap", error = %err, "describe failed");
            value.display()
        }
    }
}
