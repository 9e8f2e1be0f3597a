//! Client for the JavaScript runtime instrumentation protocol.
//!
//! The runtime exposes a JSON command/event channel. Commands carry an `id`
//! and are answered by a reply with the same `id`; everything else is an event
//! notification. Child execution contexts (workers) are multiplexed over the
//! same connection as flattened sessions, addressed by `sessionId`.
//!
//! Framing is one JSON object per message, terminated by a NUL byte. The
//! client accepts any `AsyncRead`/`AsyncWrite` pair, so a websocket or pipe
//! transport only needs to provide a byte stream speaking that framing.

mod client;
mod codec;
mod poison;
pub mod types;

pub use client::{CdpClient, CdpClientConfig, CdpSession};
pub use codec::{RemoteError, DEFAULT_MAX_MESSAGE_BYTES};
pub use types::{
    AttachedToTarget, BreakpointLocation, CallArgument, CallFrame, CdpError, CdpEvent,
    ConsoleApiCalled, EvaluateResult, ExceptionDetails, Location, PauseOnExceptionsState,
    PauseReason, PausedEvent, RemoteObject, Result, SessionId, StackTraceId, TargetInfo,
};

// The scripted runtime is only needed for tests. Compile it for this crate's
// own unit tests unconditionally, and behind `test-support` for downstream
// integration suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
