//! Debug adapter for JavaScript runtimes.
//!
//! This crate provides:
//! - A DAP server speaking the Debug Adapter Protocol over stdio.
//! - A tree of debuggable execution contexts (main context plus workers),
//!   each driven by its own thread actor so stop/continue notifications for a
//!   thread are never interleaved.
//! - Exception breakpoints with optional conditions, and stepping that can
//!   follow an async call into another context.

pub mod attach;
pub mod async_step;
pub mod breakpoints;
pub mod condition;
pub mod console;
pub mod dap_tokio;
pub mod error;
pub mod events;
pub mod exceptions;
pub mod frames;
pub mod hardening;
pub mod internal;
pub mod requests;
pub mod source_map;
pub mod targets;
pub mod thread;
pub mod wire_server;

pub use crate::error::{TargetError, ThreadError};
pub use crate::events::{AdapterEvent, StopReason, ThreadId};
pub use crate::targets::{TargetTree, TargetTreeOptions, ThreadInfo};
pub use crate::thread::StepKind;
