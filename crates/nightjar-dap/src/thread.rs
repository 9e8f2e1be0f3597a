//! Per-execution-context stepping state machine.
//!
//! Each thread is an actor: one task owns the state and consumes a mailbox fed
//! by the target tree (runtime pause/resume notifications) and by client
//! requests. Everything that touches one thread's state is therefore applied in
//! mailbox order, while different threads progress independently.
//!
//! Pairing rule: a `stopped` event is only emitted when no stop is outstanding,
//! and the `continued` event that closes it is emitted exactly once, on the
//! runtime's resume notification. Pauses the client never sees (internal
//! exceptions, filtered exceptions, async step handoffs) are resumed silently
//! and their resume notification is swallowed.
//!
//! A step that is interrupted by such a pause is carried on from where the
//! runtime stopped, so the `continued` the client already saw is still closed
//! by a `stopped`.

use std::sync::Arc;

use nightjar_cdp::{CallFrame, CdpError, CdpSession, PauseReason, PausedEvent, RemoteObject};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    async_step::AsyncStepCoordinator,
    error::ThreadError,
    events::{AdapterEvent, EventSink, StopReason, ThreadId},
    exceptions::{ExceptionBreakpoints, ExceptionDecision},
    frames::FrameTable,
    internal::has_internal_frame,
    source_map::{SourceMapper, StackFrame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    In,
    Out,
    Continue,
    Pause,
}

impl StepKind {
    pub fn from_command(command: &str) -> Option<Self> {
        match command {
            "next" => Some(StepKind::Over),
            "stepIn" => Some(StepKind::In),
            "stepOut" => Some(StepKind::Out),
            "continue" => Some(StepKind::Continue),
            "pause" => Some(StepKind::Pause),
            _ => None,
        }
    }

    fn is_step(&self) -> bool {
        matches!(self, StepKind::Over | StepKind::In | StepKind::Out)
    }

    fn request_name(&self) -> &'static str {
        match self {
            StepKind::Over => "step over",
            StepKind::In => "step into",
            StepKind::Out => "step out of",
            StepKind::Continue => "continue",
            StepKind::Pause => "pause",
        }
    }
}

/// Coarse view of a thread's state for callers outside the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Paused,
    Stepping(StepKind),
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The runtime accepted the command.
    Issued,
    /// The context went away before the command completed.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    pub exception_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub break_mode: &'static str,
    pub details: ExceptionInfoDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfoDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl ExceptionInfo {
    fn new(thrown: &RemoteObject, uncaught: bool) -> Self {
        let description = thrown.display();
        let message = description.lines().next().map(|line| {
            // "TypeError: boom" -> "boom"
            match &thrown.class_name {
                Some(class) => line
                    .strip_prefix(class.as_str())
                    .and_then(|rest| rest.strip_prefix(": "))
                    .unwrap_or(line)
                    .to_string(),
                None => line.to_string(),
            }
        });
        Self {
            exception_id: thrown
                .class_name
                .clone()
                .unwrap_or_else(|| thrown.kind.clone()),
            description: Some(description),
            break_mode: if uncaught { "unhandled" } else { "always" },
            details: ExceptionInfoDetails {
                message,
                type_name: thrown.class_name.clone(),
            },
        }
    }
}

/// Shared collaborators every thread needs.
#[derive(Clone)]
pub struct ThreadEnv {
    pub events: EventSink,
    pub exceptions: ExceptionBreakpoints,
    pub async_steps: Arc<AsyncStepCoordinator>,
    pub frames: Arc<FrameTable>,
    pub mapper: Arc<dyn SourceMapper>,
}

enum ThreadMessage {
    Paused(PausedEvent),
    Resumed,
    Step {
        kind: StepKind,
        reply: oneshot::Sender<Result<StepOutcome, ThreadError>>,
    },
    StackTrace {
        reply: oneshot::Sender<Result<Vec<StackFrame>, ThreadError>>,
    },
    ExceptionInfo {
        reply: oneshot::Sender<Result<ExceptionInfo, ThreadError>>,
    },
    Status {
        reply: oneshot::Sender<ThreadStatus>,
    },
    Terminate,
}

/// Cheap, clone-able address of a thread actor.
#[derive(Clone)]
pub struct ThreadHandle {
    thread_id: ThreadId,
    tx: mpsc::UnboundedSender<ThreadMessage>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl ThreadHandle {
    /// Start the actor for `session`. Dropping every handle does not stop it;
    /// call [`ThreadHandle::terminate`].
    pub fn spawn(thread_id: ThreadId, session: CdpSession, env: ThreadEnv) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let actor = ThreadActor {
            thread_id,
            session,
            env,
            state: ThreadState::Running,
            pending_step: None,
            stop_reported: false,
            awaiting_silent_resume: false,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self {
            thread_id,
            tx,
            cancel,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn notify_paused(&self, event: PausedEvent) {
        let _ = self.tx.send(ThreadMessage::Paused(event));
    }

    pub fn notify_resumed(&self) {
        let _ = self.tx.send(ThreadMessage::Resumed);
    }

    /// Stop the actor. In-flight and queued requests resolve as terminated.
    pub fn terminate(&self) {
        let _ = self.tx.send(ThreadMessage::Terminate);
        self.cancel.cancel();
    }

    pub async fn step(&self, kind: StepKind) -> Result<StepOutcome, ThreadError> {
        let (reply, rx) = oneshot::channel();
        self.send(ThreadMessage::Step { kind, reply })?;
        rx.await.unwrap_or(Ok(StepOutcome::Terminated))
    }

    pub async fn stack_trace(&self) -> Result<Vec<StackFrame>, ThreadError> {
        let (reply, rx) = oneshot::channel();
        self.send(ThreadMessage::StackTrace { reply })?;
        rx.await
            .unwrap_or(Err(ThreadError::Terminated(self.thread_id)))
    }

    pub async fn exception_info(&self) -> Result<ExceptionInfo, ThreadError> {
        let (reply, rx) = oneshot::channel();
        self.send(ThreadMessage::ExceptionInfo { reply })?;
        rx.await
            .unwrap_or(Err(ThreadError::Terminated(self.thread_id)))
    }

    pub async fn status(&self) -> ThreadStatus {
        let (reply, rx) = oneshot::channel();
        if self.send(ThreadMessage::Status { reply }).is_err() {
            return ThreadStatus::Terminated;
        }
        rx.await.unwrap_or(ThreadStatus::Terminated)
    }

    fn send(&self, message: ThreadMessage) -> Result<(), ThreadError> {
        self.tx
            .send(message)
            .map_err(|_| ThreadError::Terminated(self.thread_id))
    }
}

struct PausedState {
    reason: StopReason,
    call_frames: Vec<CallFrame>,
    exception: Option<ExceptionInfo>,
    /// Client frames, allocated on the first `stackTrace` of this pause.
    stack: Option<Vec<StackFrame>>,
}

enum ThreadState {
    Running,
    Paused(PausedState),
    /// The command was sent and the runtime has not resumed yet.
    Stepping(StepKind),
    Terminated,
}

/// A step the runtime is executing. Outlives the resume notification.
#[derive(Debug, Clone, Copy)]
struct PendingStep {
    kind: StepKind,
    /// Frame count of the pause the step started from.
    depth: usize,
    /// The step was carried on past a skipped pause.
    carried: bool,
}

impl ThreadState {
    fn name(&self) -> &'static str {
        match self {
            ThreadState::Running => "running",
            ThreadState::Paused(_) => "paused",
            ThreadState::Stepping(_) => "stepping",
            ThreadState::Terminated => "terminated",
        }
    }

    fn status(&self) -> ThreadStatus {
        match self {
            ThreadState::Running => ThreadStatus::Running,
            ThreadState::Paused(_) => ThreadStatus::Paused,
            ThreadState::Stepping(kind) => ThreadStatus::Stepping(*kind),
            ThreadState::Terminated => ThreadStatus::Terminated,
        }
    }
}

enum Disposition {
    Stop {
        reason: StopReason,
        description: Option<String>,
        text: Option<String>,
        exception: Option<ExceptionInfo>,
    },
    /// Resume without the client noticing.
    Skip,
    /// Carry on with a step the client is still waiting for.
    Carry(StepKind),
    /// Resume and wait for the scheduled async call to start somewhere.
    Handoff(nightjar_cdp::StackTraceId),
}

struct ThreadActor {
    thread_id: ThreadId,
    session: CdpSession,
    env: ThreadEnv,
    state: ThreadState,
    pending_step: Option<PendingStep>,
    stop_reported: bool,
    awaiting_silent_resume: bool,
    cancel: CancellationToken,
}

impl ThreadActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ThreadMessage>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                break;
            };

            match message {
                ThreadMessage::Paused(event) => self.on_paused(event).await,
                ThreadMessage::Resumed => self.on_resumed(),
                ThreadMessage::Step { kind, reply } => {
                    let result = self.step(kind).await;
                    let _ = reply.send(result);
                }
                ThreadMessage::StackTrace { reply } => {
                    let _ = reply.send(self.stack_trace());
                }
                ThreadMessage::ExceptionInfo { reply } => {
                    let _ = reply.send(self.exception_info());
                }
                ThreadMessage::Status { reply } => {
                    let _ = reply.send(self.state.status());
                }
                ThreadMessage::Terminate => break,
            }
        }

        self.state = ThreadState::Terminated;
        self.env.frames.release_thread(self.thread_id);
        tracing::debug!(target: "nightjar.dap", thread_id = self.thread_id, "thread actor stopped");
    }

    async fn step(&mut self, kind: StepKind) -> Result<StepOutcome, ThreadError> {
        let allowed = match (&self.state, kind) {
            (ThreadState::Terminated, _) => return Err(ThreadError::Terminated(self.thread_id)),
            (ThreadState::Running, StepKind::Pause) => true,
            (ThreadState::Paused(_), StepKind::Pause) => false,
            (ThreadState::Paused(_), _) => true,
            _ => false,
        };
        if !allowed {
            return Err(ThreadError::InvalidState {
                thread_id: self.thread_id,
                request: kind.request_name(),
                state: self.state.name(),
            });
        }

        let depth = match &self.state {
            ThreadState::Paused(paused) => paused.call_frames.len(),
            _ => 0,
        };
        let previous = std::mem::replace(&mut self.state, ThreadState::Stepping(kind));
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CdpError::Cancelled),
            result = issue(&self.session, kind) => result,
        };

        match result {
            Ok(()) => {
                if kind.is_step() {
                    self.pending_step = Some(PendingStep {
                        kind,
                        depth,
                        carried: false,
                    });
                } else if kind == StepKind::Continue {
                    self.pending_step = None;
                }
                if kind != StepKind::Pause {
                    self.env.frames.release_thread(self.thread_id);
                }
                Ok(StepOutcome::Issued)
            }
            Err(CdpError::SessionClosed(_) | CdpError::ConnectionClosed | CdpError::Cancelled) => {
                tracing::debug!(
                    target: "nightjar.dap",
                    thread_id = self.thread_id,
                    "context went away during {}",
                    kind.request_name()
                );
                self.state = ThreadState::Terminated;
                Ok(StepOutcome::Terminated)
            }
            Err(err) => {
                self.state = previous;
                Err(err.into())
            }
        }
    }

    fn on_resumed(&mut self) {
        if self.awaiting_silent_resume {
            self.awaiting_silent_resume = false;
            return;
        }

        match &self.state {
            ThreadState::Paused(_) => self.state = ThreadState::Running,
            ThreadState::Stepping(kind) if *kind != StepKind::Pause => {
                self.state = ThreadState::Running;
            }
            ThreadState::Running | ThreadState::Stepping(_) => {
                tracing::warn!(
                    target: "nightjar.dap",
                    thread_id = self.thread_id,
                    "protocol violation: resume notification for a running thread"
                );
                return;
            }
            ThreadState::Terminated => return,
        }

        self.env.frames.release_thread(self.thread_id);
        if self.stop_reported {
            self.stop_reported = false;
            self.emit(AdapterEvent::Continued {
                thread_id: self.thread_id,
            });
        }
    }

    async fn on_paused(&mut self, event: PausedEvent) {
        match self.state {
            ThreadState::Paused(_) => {
                tracing::warn!(
                    target: "nightjar.dap",
                    thread_id = self.thread_id,
                    reason = %event.reason,
                    "protocol violation: pause notification for a paused thread"
                );
                return;
            }
            ThreadState::Terminated => return,
            ThreadState::Running | ThreadState::Stepping(_) => {}
        }

        match self.classify(&event).await {
            Disposition::Stop {
                reason,
                description,
                text,
                exception,
            } => {
                tracing::debug!(
                    target: "nightjar.dap",
                    thread_id = self.thread_id,
                    reason = reason.as_str(),
                    "thread stopped"
                );
                self.state = ThreadState::Paused(PausedState {
                    reason,
                    call_frames: event.call_frames,
                    exception,
                    stack: None,
                });
                self.stop_reported = true;
                self.pending_step = None;
                self.env.async_steps.settle();
                self.emit(AdapterEvent::Stopped {
                    thread_id: self.thread_id,
                    reason,
                    description,
                    text,
                });
            }
            Disposition::Skip => {
                tracing::trace!(
                    target: "nightjar.dap",
                    thread_id = self.thread_id,
                    reason = %event.reason,
                    "skipping pause"
                );
                let next = self.carry_on(event.call_frames.len());
                self.resume_silently(next).await;
            }
            Disposition::Carry(kind) => {
                tracing::trace!(
                    target: "nightjar.dap",
                    thread_id = self.thread_id,
                    step = kind.request_name(),
                    "carrying step on"
                );
                self.resume_silently(kind).await;
            }
            Disposition::Handoff(parent) => {
                tracing::debug!(
                    target: "nightjar.dap",
                    thread_id = self.thread_id,
                    parent = %parent.id,
                    "step in continues in scheduled async call"
                );
                self.env.async_steps.begin(&parent).await;
                self.pending_step = None;
                self.resume_silently(StepKind::Continue).await;
            }
        }
    }

    async fn classify(&self, event: &PausedEvent) -> Disposition {
        let stepping = match self.state {
            ThreadState::Stepping(kind) => Some(kind),
            _ => self.pending_step.map(|step| step.kind),
        };
        let reason = event.pause_reason();

        if reason.is_exception() {
            if has_internal_frame(&event.call_frames) {
                return Disposition::Skip;
            }
            let thrown = event.thrown_value().unwrap_or_default();
            let uncaught = event.is_uncaught();
            return match self
                .env
                .exceptions
                .should_pause(uncaught, &thrown, &self.session)
                .await
            {
                ExceptionDecision::Pause => Disposition::Stop {
                    reason: StopReason::Exception,
                    description: Some("Paused on exception".to_string()),
                    text: Some(thrown.display()),
                    exception: Some(ExceptionInfo::new(&thrown, uncaught)),
                },
                ExceptionDecision::Resume => Disposition::Skip,
            };
        }

        if let Some(parent) = &event.async_call_stack_trace_id {
            return match stepping {
                Some(StepKind::In) => Disposition::Handoff(parent.clone()),
                _ => Disposition::Skip,
            };
        }

        if let Some(parent) = &event.async_stack_trace_id {
            if self.env.async_steps.claim(parent) {
                return stop(StopReason::Step);
            }
            if stepping.is_none()
                && event.hit_breakpoints.is_empty()
                && self.env.async_steps.is_stale(parent)
            {
                return Disposition::Skip;
            }
        }

        if !event.hit_breakpoints.is_empty() {
            return stop(StopReason::Breakpoint);
        }
        if let (Some(step), ThreadState::Running) = (self.pending_step, &self.state) {
            // Still below the frame a carried step has to get back to.
            let depth = event.call_frames.len();
            let below = match step.kind {
                StepKind::Over => depth > step.depth,
                StepKind::Out => depth >= step.depth,
                _ => false,
            };
            if step.carried && below {
                return Disposition::Carry(StepKind::Out);
            }
        }
        match stepping {
            Some(StepKind::Pause) => stop(StopReason::Pause),
            Some(StepKind::Over | StepKind::In | StepKind::Out) => stop(StopReason::Step),
            Some(StepKind::Continue) | None => match reason {
                PauseReason::BreakOnStart => stop(StopReason::Entry),
                PauseReason::Step => stop(StopReason::Step),
                _ => stop(StopReason::DebuggerStatement),
            },
        }
    }

    /// How to leave a skipped pause at `depth` frames without losing a step
    /// or pause the client asked for.
    fn carry_on(&mut self, depth: usize) -> StepKind {
        if let ThreadState::Stepping(StepKind::Pause) = self.state {
            return StepKind::Pause;
        }
        let Some(step) = self.pending_step.as_mut() else {
            return StepKind::Continue;
        };
        step.carried = true;
        match step.kind {
            StepKind::Over if depth > step.depth => StepKind::Out,
            StepKind::Out if depth < step.depth => StepKind::Over,
            kind => kind,
        }
    }

    /// Leave the current pause with `next` and swallow its resume notification.
    /// [`StepKind::Pause`] resumes and asks for a new pause.
    async fn resume_silently(&mut self, next: StepKind) {
        if next != StepKind::Pause {
            self.state = ThreadState::Running;
        }
        self.awaiting_silent_resume = true;
        let result = match next {
            StepKind::Pause => match self.session.resume().await {
                Ok(()) => self.session.pause().await,
                Err(err) => Err(err),
            },
            kind => issue(&self.session, kind).await,
        };
        if let Err(err) = result {
            self.awaiting_silent_resume = false;
            tracing::warn!(
                target: "nightjar.dap",
                thread_id = self.thread_id,
                error = %err,
                "failed to resume skipped pause"
            );
        }
    }

    fn stack_trace(&mut self) -> Result<Vec<StackFrame>, ThreadError> {
        let ThreadState::Paused(paused) = &mut self.state else {
            return Err(ThreadError::NotPaused(self.thread_id));
        };
        if let Some(stack) = &paused.stack {
            return Ok(stack.clone());
        }

        let stack: Vec<StackFrame> = paused
            .call_frames
            .iter()
            .map(|frame| {
                let id = self
                    .env
                    .frames
                    .allocate(self.thread_id, frame.call_frame_id.clone());
                StackFrame::new(id, frame, self.env.mapper.as_ref())
            })
            .collect();
        tracing::trace!(
            target: "nightjar.dap",
            thread_id = self.thread_id,
            reason = paused.reason.as_str(),
            frames = stack.len(),
            "rendered stack"
        );
        paused.stack = Some(stack.clone());
        Ok(stack)
    }

    fn exception_info(&self) -> Result<ExceptionInfo, ThreadError> {
        match &self.state {
            ThreadState::Paused(PausedState {
                exception: Some(info),
                ..
            }) => Ok(info.clone()),
            ThreadState::Paused(_) => Err(ThreadError::NoException(self.thread_id)),
            _ => Err(ThreadError::NotPaused(self.thread_id)),
        }
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.env.events.send(event);
    }
}

async fn issue(session: &CdpSession, kind: StepKind) -> Result<(), CdpError> {
    match kind {
        StepKind::Over => session.step_over().await,
        StepKind::In => session.step_into(true).await,
        StepKind::Out => session.step_out().await,
        StepKind::Continue => session.resume().await,
        StepKind::Pause => session.pause().await,
    }
}

fn stop(reason: StopReason) -> Disposition {
    Disposition::Stop {
        reason,
        description: None,
        text: None,
        exception: None,
    }
}
