use nightjar_cdp::CdpError;
use thiserror::Error;

use crate::events::ThreadId;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("cannot {request} thread {thread_id} while it is {state}")]
    InvalidState {
        thread_id: ThreadId,
        request: &'static str,
        state: &'static str,
    },

    #[error("thread {0} is not paused")]
    NotPaused(ThreadId),

    #[error("thread {0} is not paused on an exception")]
    NoException(ThreadId),

    #[error("unknown frame {0}")]
    UnknownFrame(i64),

    #[error("thread {0} has terminated")]
    Terminated(ThreadId),

    #[error(transparent)]
    Cdp(#[from] CdpError),
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error(transparent)]
    Thread(#[from] ThreadError),

    #[error(transparent)]
    Cdp(#[from] CdpError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("syntax error in condition `{condition}`: {message}")]
    Syntax { condition: String, message: String },
}
