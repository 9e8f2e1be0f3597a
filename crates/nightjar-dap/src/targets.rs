//! Execution context discovery and the thread registry.
//!
//! The tree owns one [`ThreadHandle`] per execution context. A single pump
//! task consumes the connection's event stream and routes each event to the
//! thread owning its session, so events for one context are delivered in
//! arrival order while contexts stay independent of each other.
//!
//! New contexts are announced by the runtime (auto-attach), held at their entry
//! point, and only released once exception filters, breakpoints and pending
//! async step tokens have been applied to them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use nightjar_cdp::{
    AttachedToTarget, CdpClient, CdpError, CdpEvent, CdpSession, EvaluateResult, SessionId,
};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    async_step::AsyncStepCoordinator,
    breakpoints::{Breakpoint, BreakpointSpec, BreakpointStore},
    console::{spawn_console_forwarder, ConsoleCall, ConsoleSink},
    error::{TargetError, ThreadError},
    events::{AdapterEvent, EventSink, OutputCategory, ThreadId},
    exceptions::{ExceptionBreakpoints, FilterRequest, SetFiltersOutcome},
    frames::FrameTable,
    source_map::{IdentityMapper, SourceMapper, StackFrame},
    thread::{ExceptionInfo, StepKind, StepOutcome, ThreadEnv, ThreadHandle},
};

const ROOT_NAME: &str = "Main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

pub struct TargetTreeOptions {
    pub exceptions: ExceptionBreakpoints,
    pub breakpoints: Arc<BreakpointStore>,
    pub mapper: Arc<dyn SourceMapper>,
}

impl Default for TargetTreeOptions {
    fn default() -> Self {
        Self {
            exceptions: ExceptionBreakpoints::default(),
            breakpoints: Arc::new(BreakpointStore::default()),
            mapper: Arc::new(IdentityMapper),
        }
    }
}

struct TargetEntry {
    parent: Option<ThreadId>,
    session: CdpSession,
    handle: ThreadHandle,
    name: String,
    configured: bool,
    children: Vec<ThreadId>,
}

#[derive(Default)]
struct Registry {
    entries: BTreeMap<ThreadId, TargetEntry>,
    by_session: HashMap<Option<SessionId>, ThreadId>,
}

impl Registry {
    fn owner(&self, session: Option<&SessionId>) -> Option<ThreadId> {
        self.by_session.get(&session.cloned()).copied()
    }

    /// Detach `id` and its descendants, children before parents.
    fn remove_subtree(&mut self, id: ThreadId, removed: &mut Vec<(ThreadId, TargetEntry)>) {
        let children = match self.entries.get(&id) {
            Some(entry) => entry.children.clone(),
            None => return,
        };
        for child in children {
            self.remove_subtree(child, removed);
        }
        if let Some(entry) = self.entries.remove(&id) {
            self.by_session.remove(&entry.session.id().cloned());
            if let Some(parent) = entry.parent.and_then(|p| self.entries.get_mut(&p)) {
                parent.children.retain(|c| *c != id);
            }
            removed.push((id, entry));
        }
    }
}

struct Shared {
    client: CdpClient,
    registry: Mutex<Registry>,
    next_id: AtomicI64,
    /// Serializes context configuration against filter and breakpoint
    /// updates, so every context sees each update exactly once.
    config_lock: tokio::sync::Mutex<()>,
    env: ThreadEnv,
    breakpoints: Arc<BreakpointStore>,
    console: ConsoleSink,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Thread registry bound to one runtime connection.
#[derive(Clone)]
pub struct TargetTree {
    shared: Arc<Shared>,
}

impl TargetTree {
    /// Take over `client`: register and configure the root context, turn on
    /// auto-attach, and start routing events.
    pub async fn attach(
        client: CdpClient,
        events: EventSink,
        options: TargetTreeOptions,
    ) -> Result<Self, TargetError> {
        // Subscribe before the first command so no event is missed.
        let rx = client.subscribe_events();

        let env = ThreadEnv {
            events: events.clone(),
            exceptions: options.exceptions,
            async_steps: Arc::new(AsyncStepCoordinator::default()),
            frames: Arc::new(FrameTable::default()),
            mapper: options.mapper,
        };
        let shared = Arc::new(Shared {
            client: client.clone(),
            registry: Mutex::new(Registry::default()),
            next_id: AtomicI64::new(1),
            config_lock: tokio::sync::Mutex::new(()),
            env,
            breakpoints: options.breakpoints,
            console: spawn_console_forwarder(events),
            pump: Mutex::new(None),
        });

        let root = shared.register(None, client.root_session(), ROOT_NAME.to_string());
        let pump = tokio::spawn(pump(shared.clone(), rx));
        *shared.pump.lock() = Some(pump);

        let session = client.root_session();
        if let Err(err) = shared.configure(root, &session).await {
            client.shutdown();
            return Err(err.into());
        }
        tracing::info!(target: "nightjar.dap", thread_id = root, "attached to root context");

        Ok(Self { shared })
    }

    /// Close the connection and wait until every thread has been torn down.
    pub async fn shutdown(&self) {
        self.shared.client.shutdown();
        let pump = self.shared.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
    }

    /// Live threads, oldest first.
    pub fn list_threads(&self) -> Vec<ThreadInfo> {
        self.shared
            .registry
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| ThreadInfo {
                id: *id,
                name: entry.name.clone(),
            })
            .collect()
    }

    /// Route to the thread registered under `thread_id`.
    pub fn thread(&self, thread_id: ThreadId) -> Result<ThreadHandle, TargetError> {
        self.shared
            .registry
            .lock()
            .entries
            .get(&thread_id)
            .map(|entry| entry.handle.clone())
            .ok_or(TargetError::UnknownThread(thread_id))
    }

    pub async fn step(&self, thread_id: ThreadId, kind: StepKind) -> Result<StepOutcome, TargetError> {
        Ok(self.thread(thread_id)?.step(kind).await?)
    }

    pub async fn stack_trace(&self, thread_id: ThreadId) -> Result<Vec<StackFrame>, TargetError> {
        Ok(self.thread(thread_id)?.stack_trace().await?)
    }

    pub async fn exception_info(&self, thread_id: ThreadId) -> Result<ExceptionInfo, TargetError> {
        Ok(self.thread(thread_id)?.exception_info().await?)
    }

    /// Replace the exception filters everywhere, including contexts that are
    /// still being configured.
    pub async fn set_exception_filters(&self, requests: &[FilterRequest]) -> SetFiltersOutcome {
        let shared = &self.shared;
        let _guard = shared.config_lock.lock().await;
        let outcome = shared.env.exceptions.set_filters(requests);
        for diagnostic in &outcome.diagnostics {
            shared.emit(AdapterEvent::output(OutputCategory::Stderr, diagnostic.clone()));
        }

        for (thread_id, session) in shared.configured_sessions() {
            if let Err(err) = session.set_pause_on_exceptions(outcome.pause_state).await {
                tracing::warn!(
                    target: "nightjar.dap",
                    thread_id,
                    error = %err,
                    "failed to update exception pause state"
                );
            }
        }
        outcome
    }

    pub async fn set_breakpoints(&self, path: &str, specs: &[BreakpointSpec]) -> Vec<Breakpoint> {
        let shared = &self.shared;
        let url = shared.env.mapper.url_for_path(path);
        let _guard = shared.config_lock.lock().await;
        let outcome = shared.breakpoints.replace(&url, specs);
        for diagnostic in &outcome.diagnostics {
            shared.emit(AdapterEvent::output(OutputCategory::Stderr, diagnostic.clone()));
        }
        for (thread_id, session) in shared.configured_sessions() {
            shared.breakpoints.apply_source(thread_id, &session, &url).await;
        }
        outcome.breakpoints
    }

    /// Evaluate in a paused frame, or in the root context without one.
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> Result<EvaluateResult, TargetError> {
        let shared = &self.shared;
        match frame_id {
            Some(frame_id) => {
                let frame = shared
                    .env
                    .frames
                    .get(frame_id)
                    .ok_or(ThreadError::UnknownFrame(frame_id))?;
                let session = shared
                    .session_of(frame.thread_id)
                    .ok_or(TargetError::UnknownThread(frame.thread_id))?;
                Ok(session
                    .evaluate_on_call_frame(&frame.call_frame_id, expression, false)
                    .await?)
            }
            None => {
                let session = shared.root_session().ok_or(CdpError::ConnectionClosed)?;
                Ok(session.evaluate(expression, false).await?)
            }
        }
    }
}

impl Shared {
    fn emit(&self, event: AdapterEvent) {
        let _ = self.env.events.send(event);
    }

    fn register(&self, parent: Option<ThreadId>, session: CdpSession, name: String) -> ThreadId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ThreadHandle::spawn(id, session.clone(), self.env.clone());
        self.env.async_steps.register(id, session.clone());
        {
            let mut registry = self.registry.lock();
            registry.by_session.insert(session.id().cloned(), id);
            if let Some(parent) = parent.and_then(|p| registry.entries.get_mut(&p)) {
                parent.children.push(id);
            }
            registry.entries.insert(
                id,
                TargetEntry {
                    parent,
                    session,
                    handle,
                    name,
                    configured: false,
                    children: Vec::new(),
                },
            );
        }
        self.emit(AdapterEvent::ThreadStarted { thread_id: id });
        id
    }

    fn configured_sessions(&self) -> Vec<(ThreadId, CdpSession)> {
        self.registry
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.configured)
            .map(|(id, entry)| (*id, entry.session.clone()))
            .collect()
    }

    fn session_of(&self, thread_id: ThreadId) -> Option<CdpSession> {
        self.registry
            .lock()
            .entries
            .get(&thread_id)
            .map(|entry| entry.session.clone())
    }

    fn root_session(&self) -> Option<CdpSession> {
        self.registry
            .lock()
            .entries
            .values()
            .find(|entry| entry.parent.is_none())
            .map(|entry| entry.session.clone())
    }

    async fn configure(&self, thread_id: ThreadId, session: &CdpSession) -> Result<(), CdpError> {
        session.runtime_enable().await?;
        session.debugger_enable().await?;
        {
            let _guard = self.config_lock.lock().await;
            let state = self.env.exceptions.snapshot().pause_state();
            session.set_pause_on_exceptions(state).await?;
            self.breakpoints.apply_all(thread_id, session).await;
            for token in self.env.async_steps.pending_tokens() {
                if let Err(err) = session.pause_on_async_call(&token).await {
                    tracing::debug!(
                        target: "nightjar.dap",
                        thread_id,
                        error = %err,
                        "pauseOnAsyncCall failed during configuration"
                    );
                }
            }
            if let Some(entry) = self.registry.lock().entries.get_mut(&thread_id) {
                entry.configured = true;
            }
        }
        session.set_auto_attach(true).await?;
        session.run_if_waiting_for_debugger().await?;
        tracing::debug!(target: "nightjar.dap", thread_id, "context configured");
        Ok(())
    }

    fn on_context_created(self: &Arc<Self>, parent_session: Option<&SessionId>, attached: AttachedToTarget) {
        let parent = self.registry.lock().owner(parent_session);
        if parent.is_none() {
            tracing::warn!(
                target: "nightjar.dap",
                session = %attached.session_id,
                "context announced by an unknown parent"
            );
        }

        let next = self.next_id.load(Ordering::Relaxed);
        let info = &attached.target_info;
        let name = if info.title.is_empty() {
            format!("{} {next}", info.kind)
        } else {
            info.title.clone()
        };
        let session = self.client.session(Some(attached.session_id.clone()));
        let thread_id = self.register(parent, session.clone(), name);
        tracing::debug!(
            target: "nightjar.dap",
            thread_id,
            session = %attached.session_id,
            kind = %info.kind,
            waiting = attached.waiting_for_debugger,
            "context created"
        );

        let shared = self.clone();
        tokio::spawn(async move {
            if let Err(err) = shared.configure(thread_id, &session).await {
                tracing::warn!(
                    target: "nightjar.dap",
                    thread_id,
                    error = %err,
                    "failed to configure context"
                );
            }
        });
    }

    fn on_context_destroyed(&self, thread_id: ThreadId) {
        let mut removed = Vec::new();
        self.registry.lock().remove_subtree(thread_id, &mut removed);
        for (id, entry) in removed {
            entry.handle.terminate();
            self.env.frames.release_thread(id);
            self.env.async_steps.unregister(id);
            self.breakpoints.forget_thread(id);
            tracing::debug!(target: "nightjar.dap", thread_id = id, "context destroyed");
            self.emit(AdapterEvent::ThreadExited { thread_id: id });
        }
    }

    fn handle_event(self: &Arc<Self>, event: CdpEvent) {
        match event {
            CdpEvent::Paused { session, event } => match self.handle_for(session.as_ref()) {
                Some(handle) => handle.notify_paused(event),
                None => tracing::warn!(
                    target: "nightjar.dap",
                    session = ?session,
                    "protocol violation: pause for an unregistered context"
                ),
            },
            CdpEvent::Resumed { session } => match self.handle_for(session.as_ref()) {
                Some(handle) => handle.notify_resumed(),
                None => tracing::warn!(
                    target: "nightjar.dap",
                    session = ?session,
                    "protocol violation: resume for an unregistered context"
                ),
            },
            CdpEvent::AttachedToTarget { session, attached } => {
                self.on_context_created(session.as_ref(), attached);
            }
            CdpEvent::DetachedFromTarget { child, .. } => {
                let owner = self.registry.lock().owner(Some(&child));
                match owner {
                    Some(thread_id) => self.on_context_destroyed(thread_id),
                    None => tracing::debug!(
                        target: "nightjar.dap",
                        session = %child,
                        "detach for an unknown context"
                    ),
                }
            }
            CdpEvent::ExceptionThrown { details, .. } => {
                self.emit(AdapterEvent::output(
                    OutputCategory::Stderr,
                    format!("Uncaught {}\n", details.display()),
                ));
            }
            CdpEvent::ConsoleApiCalled { session, call } => {
                let _ = self.console.send(ConsoleCall {
                    session: self.client.session(session),
                    call,
                });
            }
            CdpEvent::ExecutionContextsCleared { session } => {
                tracing::debug!(target: "nightjar.dap", session = ?session, "execution contexts cleared");
            }
        }
    }

    fn handle_for(&self, session: Option<&SessionId>) -> Option<ThreadHandle> {
        let registry = self.registry.lock();
        let id = registry.owner(session)?;
        registry.entries.get(&id).map(|entry| entry.handle.clone())
    }

    fn teardown(&self) {
        let roots: Vec<ThreadId> = self
            .registry
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        for root in roots {
            self.on_context_destroyed(root);
        }
        // Orphans whose parent vanished before they were announced.
        let rest: Vec<ThreadId> = self.registry.lock().entries.keys().copied().collect();
        for id in rest {
            self.on_context_destroyed(id);
        }
    }
}

async fn pump(shared: Arc<Shared>, mut rx: broadcast::Receiver<CdpEvent>) {
    let shutdown = shared.client.shutdown_token();
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => shared.handle_event(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target: "nightjar.dap", skipped, "event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    // Deliver whatever the runtime sent before the connection went away.
    while let Ok(event) = rx.try_recv() {
        shared.handle_event(event);
    }

    shared.teardown();
    tracing::info!(target: "nightjar.dap", "runtime connection closed");
    shared.emit(AdapterEvent::Terminated);
}
