use std::{fmt, io};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{method} failed ({code}): {message}")]
    CommandFailed {
        method: String,
        code: i64,
        message: String,
    },

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, CdpError>;

/// Flattened session identifier.
///
/// `None` in APIs that take `Option<&SessionId>` addresses the root execution
/// context of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: String,
    pub line_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub call_frame_id: String,
    pub function_name: String,
    pub location: Location,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unserializable_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl RemoteObject {
    /// Short human readable rendering used for output and exception details.
    pub fn display(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        if let Some(unserializable) = &self.unserializable_value {
            return unserializable.clone();
        }
        match &self.value {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => self.kind.clone(),
        }
    }

    /// Argument form of this value for `Runtime.callFunctionOn`.
    pub fn as_call_argument(&self) -> CallArgument {
        if let Some(object_id) = &self.object_id {
            return CallArgument::object(object_id.clone());
        }
        if let Some(unserializable) = &self.unserializable_value {
            return CallArgument {
                unserializable_value: Some(unserializable.clone()),
                ..CallArgument::default()
            };
        }
        match &self.value {
            Some(value) => CallArgument::value(value.clone()),
            // `undefined` is the absence of both value and object id.
            None => CallArgument::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallArgument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unserializable_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl CallArgument {
    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn object(object_id: impl Into<String>) -> Self {
        Self {
            object_id: Some(object_id.into()),
            ..Self::default()
        }
    }
}

/// Identifier of an asynchronous stack trace, used to correlate a scheduled
/// async call with the pause that happens when it starts running.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debugger_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    Ambiguous,
    Assert,
    BreakOnStart,
    DebugCommand,
    Exception,
    Instrumentation,
    Other,
    PromiseRejection,
    Step,
    Unknown(String),
}

impl From<&str> for PauseReason {
    fn from(value: &str) -> Self {
        match value {
            "ambiguous" => Self::Ambiguous,
            "assert" => Self::Assert,
            "Break on start" => Self::BreakOnStart,
            "debugCommand" => Self::DebugCommand,
            "exception" => Self::Exception,
            "instrumentation" => Self::Instrumentation,
            "other" => Self::Other,
            "promiseRejection" => Self::PromiseRejection,
            "step" => Self::Step,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl PauseReason {
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception | Self::PromiseRejection)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedEvent {
    #[serde(default)]
    pub call_frames: Vec<CallFrame>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_stack_trace_id: Option<StackTraceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_call_stack_trace_id: Option<StackTraceId>,
}

impl PausedEvent {
    pub fn pause_reason(&self) -> PauseReason {
        PauseReason::from(self.reason.as_str())
    }

    /// The thrown value for exception pauses.
    pub fn thrown_value(&self) -> Option<RemoteObject> {
        let data = self.data.as_ref()?;
        serde_json::from_value(data.clone()).ok()
    }

    /// Whether the exception escapes every handler. Only meaningful for
    /// exception pauses; the runtime reports it in the pause payload.
    pub fn is_uncaught(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|data| data.get("uncaught"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTarget {
    pub session_id: SessionId,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    #[serde(default)]
    pub exception_id: i64,
    pub text: String,
    #[serde(default)]
    pub line_number: u32,
    #[serde(default)]
    pub column_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    pub fn display(&self) -> String {
        match &self.exception {
            Some(exception) => exception.display(),
            None => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalled {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
    #[serde(default)]
    pub execution_context_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: RemoteObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_details: Option<ExceptionDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseOnExceptionsState {
    None,
    Uncaught,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointLocation {
    pub breakpoint_id: String,
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// Events decoded from the instrumentation channel.
///
/// `session` is the flattened session the event was delivered on (`None` for
/// the root execution context).
#[derive(Debug, Clone, PartialEq)]
pub enum CdpEvent {
    Paused {
        session: Option<SessionId>,
        event: PausedEvent,
    },
    Resumed {
        session: Option<SessionId>,
    },
    AttachedToTarget {
        session: Option<SessionId>,
        attached: AttachedToTarget,
    },
    DetachedFromTarget {
        session: Option<SessionId>,
        child: SessionId,
    },
    ExceptionThrown {
        session: Option<SessionId>,
        details: ExceptionDetails,
    },
    ConsoleApiCalled {
        session: Option<SessionId>,
        call: ConsoleApiCalled,
    },
    ExecutionContextsCleared {
        session: Option<SessionId>,
    },
}

impl CdpEvent {
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            CdpEvent::Paused { session, .. }
            | CdpEvent::Resumed { session }
            | CdpEvent::AttachedToTarget { session, .. }
            | CdpEvent::DetachedFromTarget { session, .. }
            | CdpEvent::ExceptionThrown { session, .. }
            | CdpEvent::ConsoleApiCalled { session, .. }
            | CdpEvent::ExecutionContextsCleared { session } => session.as_ref(),
        }
    }

    /// Decode an event notification. Returns `Ok(None)` for methods the bridge
    /// does not consume.
    pub fn decode(method: &str, params: Value, session: Option<SessionId>) -> Result<Option<Self>> {
        let event = match method {
            "Debugger.paused" => CdpEvent::Paused {
                session,
                event: serde_json::from_value(params)?,
            },
            "Debugger.resumed" => CdpEvent::Resumed { session },
            "Target.attachedToTarget" => CdpEvent::AttachedToTarget {
                session,
                attached: serde_json::from_value(params)?,
            },
            "Target.detachedFromTarget" => {
                let child = params
                    .get("sessionId")
                    .cloned()
                    .ok_or_else(|| {
                        CdpError::Protocol("Target.detachedFromTarget without sessionId".to_string())
                    })
                    .and_then(|v| serde_json::from_value(v).map_err(CdpError::from))?;
                CdpEvent::DetachedFromTarget { session, child }
            }
            "Runtime.exceptionThrown" => {
                let details = params.get("exceptionDetails").cloned().ok_or_else(|| {
                    CdpError::Protocol("Runtime.exceptionThrown without exceptionDetails".to_string())
                })?;
                CdpEvent::ExceptionThrown {
                    session,
                    details: serde_json::from_value(details)?,
                }
            }
            "Runtime.consoleAPICalled" => CdpEvent::ConsoleApiCalled {
                session,
                call: serde_json::from_value(params)?,
            },
            "Runtime.executionContextsCleared" => CdpEvent::ExecutionContextsCleared { session },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
