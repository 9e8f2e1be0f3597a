//! Marking of scripts the adapter itself runs inside the debuggee.
//!
//! Every introspection call carries a `sourceURL` pointing at
//! [`INTERNAL_SOURCE_URL`], so pauses raised while one of those scripts is on
//! the stack can be recognised and resumed without reaching the client.

use nightjar_cdp::CallFrame;

pub const INTERNAL_SOURCE_URL: &str = "nightjar-internal.js";

/// Append the internal `sourceURL` marker to `source`.
pub fn mark_internal(source: &str) -> String {
    format!("{source}\n//# sourceURL={INTERNAL_SOURCE_URL}")
}

pub fn is_internal_frame(frame: &CallFrame) -> bool {
    frame.url == INTERNAL_SOURCE_URL
}

pub fn has_internal_frame(frames: &[CallFrame]) -> bool {
    frames.iter().any(is_internal_frame)
}
