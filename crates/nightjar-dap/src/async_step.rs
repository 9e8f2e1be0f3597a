//! Correlation of step-in requests that cross into scheduled async work.
//!
//! When a `stepIn` stops at the point where an async call is scheduled, the
//! runtime hands back the scheduled call's stack trace id. Every live context
//! is then asked to pause when that call starts, and the id is kept as a
//! pending token. Whichever thread pauses with a matching async parent claims
//! the token and surfaces the stop as a step, even if it is not the thread the
//! step was issued on.

use std::collections::{BTreeMap, HashSet, VecDeque};

use nightjar_cdp::{CdpSession, StackTraceId};
use parking_lot::Mutex;

use crate::events::ThreadId;

const RETIRED_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Tokens {
    pending: HashSet<StackTraceId>,
    retired: VecDeque<StackTraceId>,
}

impl Tokens {
    fn retire(&mut self, id: StackTraceId) {
        if self.retired.contains(&id) {
            return;
        }
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }
}

#[derive(Default)]
pub struct AsyncStepCoordinator {
    sessions: Mutex<BTreeMap<ThreadId, CdpSession>>,
    tokens: Mutex<Tokens>,
}

impl AsyncStepCoordinator {
    pub fn register(&self, thread_id: ThreadId, session: CdpSession) {
        self.sessions.lock().insert(thread_id, session);
    }

    pub fn unregister(&self, thread_id: ThreadId) {
        self.sessions.lock().remove(&thread_id);
    }

    /// Start waiting for the async call scheduled under `parent`.
    pub async fn begin(&self, parent: &StackTraceId) {
        self.tokens.lock().pending.insert(parent.clone());

        let sessions: Vec<(ThreadId, CdpSession)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect();
        for (thread_id, session) in sessions {
            if let Err(err) = session.pause_on_async_call(parent).await {
                tracing::debug!(
                    target: "nightjar.dap",
                    thread_id,
                    error = %err,
                    "pauseOnAsyncCall failed"
                );
            }
        }
    }

    /// Take ownership of a pause whose async parent is `id`.
    pub fn claim(&self, id: &StackTraceId) -> bool {
        let mut tokens = self.tokens.lock();
        if tokens.pending.remove(id) {
            tokens.retire(id.clone());
            true
        } else {
            false
        }
    }

    /// Whether a pause with async parent `id` belongs to scheduled work no
    /// pending step is waiting for.
    pub fn is_stale(&self, id: &StackTraceId) -> bool {
        let tokens = self.tokens.lock();
        tokens.retired.contains(id) || (!tokens.pending.is_empty() && !tokens.pending.contains(id))
    }

    /// A stop reached the client; outstanding handoffs are over.
    pub fn settle(&self) {
        let mut tokens = self.tokens.lock();
        let pending: Vec<_> = tokens.pending.drain().collect();
        for id in pending {
            tokens.retire(id);
        }
    }

    pub fn pending_tokens(&self) -> Vec<StackTraceId> {
        self.tokens.lock().pending.iter().cloned().collect()
    }
}
