//! Client-visible events produced by threads and the target tree.

use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Process-lifetime-unique thread handle exposed to the client.
pub type ThreadId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Exception,
    Pause,
    Entry,
    DebuggerStatement,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Exception => "exception",
            StopReason::Pause => "pause",
            StopReason::Entry => "entry",
            StopReason::DebuggerStatement => "debugger statement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Console,
    Stdout,
    Stderr,
}

impl OutputCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputCategory::Console => "console",
            OutputCategory::Stdout => "stdout",
            OutputCategory::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Stopped {
        thread_id: ThreadId,
        reason: StopReason,
        description: Option<String>,
        text: Option<String>,
    },
    Continued {
        thread_id: ThreadId,
    },
    ThreadStarted {
        thread_id: ThreadId,
    },
    ThreadExited {
        thread_id: ThreadId,
    },
    Output {
        category: OutputCategory,
        output: String,
    },
    Terminated,
}

impl AdapterEvent {
    pub fn output(category: OutputCategory, output: impl Into<String>) -> Self {
        AdapterEvent::Output {
            category,
            output: output.into(),
        }
    }

    /// DAP event name and body.
    pub fn to_dap(&self) -> (&'static str, Option<Value>) {
        match self {
            AdapterEvent::Stopped {
                thread_id,
                reason,
                description,
                text,
            } => {
                let mut body = json!({
                    "reason": reason.as_str(),
                    "threadId": thread_id,
                    "allThreadsStopped": false,
                });
                if let Some(description) = description {
                    body["description"] = json!(description);
                }
                if let Some(text) = text {
                    body["text"] = json!(text);
                }
                ("stopped", Some(body))
            }
            AdapterEvent::Continued { thread_id } => (
                "continued",
                Some(json!({ "threadId": thread_id, "allThreadsContinued": false })),
            ),
            AdapterEvent::ThreadStarted { thread_id } => (
                "thread",
                Some(json!({ "reason": "started", "threadId": thread_id })),
            ),
            AdapterEvent::ThreadExited { thread_id } => (
                "thread",
                Some(json!({ "reason": "exited", "threadId": thread_id })),
            ),
            AdapterEvent::Output { category, output } => (
                "output",
                Some(json!({ "category": category.as_str(), "output": output })),
            ),
            AdapterEvent::Terminated => ("terminated", None),
        }
    }
}

/// Where threads and the target tree publish client-visible events.
pub type EventSink = mpsc::UnboundedSender<AdapterEvent>;
