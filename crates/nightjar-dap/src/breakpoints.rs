//! Process-wide line breakpoints.
//!
//! The store keeps the client's breakpoints per source URL and installs them in
//! every context it is asked to configure. Runtime breakpoint ids are tracked
//! per thread so a later `setBreakpoints` for the same source can replace them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicI64, Ordering},
};

use nightjar_cdp::CdpSession;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{condition::ConditionValidator, events::ThreadId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    /// 1-based.
    pub line: u32,
    /// 1-based.
    pub column: Option<u32>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub id: i64,
    pub verified: bool,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredBreakpoint {
    client: Breakpoint,
    condition: Option<String>,
}

impl StoredBreakpoint {
    fn installable(&self) -> bool {
        self.client.verified
    }
}

#[derive(Debug, Default)]
pub struct SetBreakpointsOutcome {
    pub breakpoints: Vec<Breakpoint>,
    pub diagnostics: Vec<String>,
}

pub struct BreakpointStore {
    next_id: AtomicI64,
    validator: ConditionValidator,
    sources: Mutex<BTreeMap<String, Vec<StoredBreakpoint>>>,
    installed: Mutex<HashMap<(ThreadId, String), Vec<String>>>,
}

impl BreakpointStore {
    pub fn new(validator: ConditionValidator) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            validator,
            sources: Mutex::new(BTreeMap::new()),
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the breakpoints of `url`. Nothing is installed yet; call
    /// [`BreakpointStore::apply_source`] for every live context afterwards.
    pub fn replace(&self, url: &str, specs: &[BreakpointSpec]) -> SetBreakpointsOutcome {
        let mut outcome = SetBreakpointsOutcome::default();
        let mut stored = Vec::with_capacity(specs.len());

        for spec in specs {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let condition = spec
                .condition
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            let message = match &condition {
                Some(condition) => self.validator.validate_expression(condition).err(),
                None => None,
            }
            .map(|err| err.to_string());

            if let Some(message) = &message {
                outcome
                    .diagnostics
                    .push(format!("{url}:{}: breakpoint not set. {message}\n", spec.line));
            }
            let breakpoint = Breakpoint {
                id,
                verified: message.is_none(),
                line: spec.line,
                column: spec.column,
                message,
            };
            outcome.breakpoints.push(breakpoint.clone());
            stored.push(StoredBreakpoint {
                client: breakpoint,
                condition,
            });
        }

        let mut sources = self.sources.lock();
        if stored.is_empty() {
            sources.remove(url);
        } else {
            sources.insert(url.to_string(), stored);
        }
        outcome
    }

    /// Bring `url`'s runtime breakpoints in the context of `thread_id` in line
    /// with the store.
    pub async fn apply_source(&self, thread_id: ThreadId, session: &CdpSession, url: &str) {
        let previous = self
            .installed
            .lock()
            .remove(&(thread_id, url.to_string()))
            .unwrap_or_default();
        for breakpoint_id in previous {
            if let Err(err) = session.remove_breakpoint(&breakpoint_id).await {
                tracing::debug!(
                    target: "nightjar.dap",
                    thread_id,
                    breakpoint_id = %breakpoint_id,
                    error = %err,
                    "failed to remove breakpoint"
                );
            }
        }

        let wanted: Vec<StoredBreakpoint> = self
            .sources
            .lock()
            .get(url)
            .map(|bps| bps.iter().filter(|bp| bp.installable()).cloned().collect())
            .unwrap_or_default();

        let mut ids = Vec::with_capacity(wanted.len());
        for bp in wanted {
            let line = bp.client.line.saturating_sub(1);
            let column = bp.client.column.map(|c| c.saturating_sub(1));
            match session
                .set_breakpoint_by_url(url, line, column, bp.condition.as_deref())
                .await
            {
                Ok(location) => ids.push(location.breakpoint_id),
                Err(err) => tracing::warn!(
                    target: "nightjar.dap",
                    thread_id,
                    url,
                    line = bp.client.line,
                    error = %err,
                    "failed to install breakpoint"
                ),
            }
        }
        if !ids.is_empty() {
            self.installed.lock().insert((thread_id, url.to_string()), ids);
        }
    }

    /// Install every stored breakpoint in a freshly discovered context.
    pub async fn apply_all(&self, thread_id: ThreadId, session: &CdpSession) {
        let urls: Vec<String> = self.sources.lock().keys().cloned().collect();
        for url in urls {
            self.apply_source(thread_id, session, &url).await;
        }
    }

    pub fn forget_thread(&self, thread_id: ThreadId) {
        self.installed.lock().retain(|(owner, _), _| *owner != thread_id);
    }
}

impl Default for BreakpointStore {
    fn default() -> Self {
        Self::new(ConditionValidator::default())
    }
}
