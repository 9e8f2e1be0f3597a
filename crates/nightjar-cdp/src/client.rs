use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{broadcast, oneshot},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{CdpReader, CdpWriter, Incoming, OutgoingCommand, DEFAULT_MAX_MESSAGE_BYTES},
    poison::lock,
    types::{
        BreakpointLocation, CallArgument, CdpError, CdpEvent, EvaluateResult,
        PauseOnExceptionsState, Result, SessionId, StackTraceId,
    },
};

#[derive(Debug, Clone)]
pub struct CdpClientConfig {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub event_channel_size: usize,
    pub max_message_bytes: usize,
}

impl Default for CdpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            event_channel_size: 256,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
struct PendingCommand {
    method: String,
    session: Option<SessionId>,
    tx: oneshot::Sender<Result<Value>>,
}

struct Inner {
    writer: tokio::sync::Mutex<CdpWriter<BoxedWriter>>,
    pending: Mutex<HashMap<u64, PendingCommand>>,
    closed_sessions: Mutex<HashSet<SessionId>>,
    next_id: AtomicU64,
    events: broadcast::Sender<CdpEvent>,
    shutdown: CancellationToken,
    config: CdpClientConfig,
}

/// Connection to a runtime's instrumentation endpoint.
///
/// Cloning is cheap; all clones share the same connection, pending-reply table
/// and event fan-out.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<Inner>,
}

impl CdpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, CdpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: CdpClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CdpError::Timeout)??;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self::connect_io(reader, writer, config))
    }

    /// Speak the framed protocol over an arbitrary byte stream pair.
    ///
    /// Must be called from within a tokio runtime; the read loop runs as a
    /// spawned task for the lifetime of the connection.
    pub fn connect_io<R, W>(reader: R, writer: W, config: CdpClientConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));
        let reader = CdpReader::new(reader, config.max_message_bytes);
        let writer: BoxedWriter = Box::new(writer);

        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(CdpWriter::new(writer)),
            pending: Mutex::new(HashMap::new()),
            closed_sessions: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        Self { inner }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the connection is shut down explicitly or the runtime
    /// closes it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.inner.events.subscribe()
    }

    pub fn root_session(&self) -> CdpSession {
        self.session(None)
    }

    pub fn session(&self, id: Option<SessionId>) -> CdpSession {
        CdpSession {
            client: self.clone(),
            id,
        }
    }

    pub fn is_session_closed(&self, session: &SessionId) -> bool {
        lock(&self.inner.closed_sessions, "closed_sessions").contains(session)
    }

    pub async fn send_command(
        &self,
        session: Option<&SessionId>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CdpError::Cancelled);
        }
        if let Some(session) = session {
            if self.is_session_closed(session) {
                return Err(CdpError::SessionClosed(session.clone()));
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending, "pending").insert(
            id,
            PendingCommand {
                method: method.to_string(),
                session: session.cloned(),
                tx,
            },
        );

        tracing::trace!(target: "nightjar.cdp", id, method, session = ?session, "send command");

        let write = {
            let mut writer = self.inner.writer.lock().await;
            writer
                .write_command(&OutgoingCommand {
                    id,
                    method,
                    params: &params,
                    session_id: session,
                })
                .await
        };
        if let Err(err) = write {
            self.remove_pending(id);
            return Err(err);
        }

        tokio::select! {
            biased;
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => match res {
                Ok(Ok(reply)) => reply,
                Ok(Err(_closed)) => Err(CdpError::ConnectionClosed),
                Err(_elapsed) => {
                    self.remove_pending(id);
                    Err(CdpError::Timeout)
                }
            },
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id);
                Err(CdpError::Cancelled)
            }
        }
    }

    fn remove_pending(&self, id: u64) {
        lock(&self.inner.pending, "pending").remove(&id);
    }
}

/// Command facade bound to one flattened session.
#[derive(Clone)]
pub struct CdpSession {
    client: CdpClient,
    id: Option<SessionId>,
}

impl CdpSession {
    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    pub fn client(&self) -> &CdpClient {
        &self.client
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.client
            .send_command(self.id.as_ref(), method, params)
            .await
    }

    pub async fn runtime_enable(&self) -> Result<()> {
        self.send("Runtime.enable", json!({})).await?;
        Ok(())
    }

    pub async fn run_if_waiting_for_debugger(&self) -> Result<()> {
        self.send("Runtime.runIfWaitingForDebugger", json!({})).await?;
        Ok(())
    }

    pub async fn debugger_enable(&self) -> Result<()> {
        self.send("Debugger.enable", json!({})).await?;
        Ok(())
    }

    /// Ask the runtime to report child execution contexts, holding each one at
    /// its entry point until `Runtime.runIfWaitingForDebugger` is sent on the
    /// child session.
    pub async fn set_auto_attach(&self, wait_for_debugger_on_start: bool) -> Result<()> {
        self.send(
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": wait_for_debugger_on_start,
                "flatten": true,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_pause_on_exceptions(&self, state: PauseOnExceptionsState) -> Result<()> {
        self.send("Debugger.setPauseOnExceptions", json!({ "state": state }))
            .await?;
        Ok(())
    }

    pub async fn set_breakpoint_by_url(
        &self,
        url: &str,
        line_number: u32,
        column_number: Option<u32>,
        condition: Option<&str>,
    ) -> Result<BreakpointLocation> {
        let mut params = json!({ "url": url, "lineNumber": line_number });
        if let Some(column) = column_number {
            params["columnNumber"] = json!(column);
        }
        if let Some(condition) = condition {
            params["condition"] = json!(condition);
        }
        let reply = self.send("Debugger.setBreakpointByUrl", params).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<()> {
        self.send(
            "Debugger.removeBreakpoint",
            json!({ "breakpointId": breakpoint_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.send("Debugger.resume", json!({})).await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.send("Debugger.pause", json!({})).await?;
        Ok(())
    }

    pub async fn step_over(&self) -> Result<()> {
        self.send("Debugger.stepOver", json!({})).await?;
        Ok(())
    }

    pub async fn step_into(&self, break_on_async_call: bool) -> Result<()> {
        self.send(
            "Debugger.stepInto",
            json!({ "breakOnAsyncCall": break_on_async_call }),
        )
        .await?;
        Ok(())
    }

    pub async fn step_out(&self) -> Result<()> {
        self.send("Debugger.stepOut", json!({})).await?;
        Ok(())
    }

    /// Pause as soon as the async call identified by `parent` starts running in
    /// this context.
    pub async fn pause_on_async_call(&self, parent: &StackTraceId) -> Result<()> {
        self.send(
            "Debugger.pauseOnAsyncCall",
            json!({ "parentStackTraceId": parent }),
        )
        .await?;
        Ok(())
    }

    pub async fn evaluate_on_call_frame(
        &self,
        call_frame_id: &str,
        expression: &str,
        silent: bool,
    ) -> Result<EvaluateResult> {
        let reply = self
            .send(
                "Debugger.evaluateOnCallFrame",
                json!({
                    "callFrameId": call_frame_id,
                    "expression": expression,
                    "silent": silent,
                    "returnByValue": false,
                }),
            )
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn evaluate(&self, expression: &str, silent: bool) -> Result<EvaluateResult> {
        let reply = self
            .send(
                "Runtime.evaluate",
                json!({ "expression": expression, "silent": silent }),
            )
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn call_function_on(
        &self,
        object_id: &str,
        function_declaration: &str,
        arguments: Vec<CallArgument>,
        return_by_value: bool,
        silent: bool,
    ) -> Result<EvaluateResult> {
        let reply = self
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function_declaration,
                    "arguments": arguments,
                    "returnByValue": return_by_value,
                    "silent": silent,
                }),
            )
            .await?;
        Ok(serde_json::from_value(reply)?)
    }
}

async fn read_loop<R>(mut reader: CdpReader<R>, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_message() => res,
        };

        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(target: "nightjar.cdp", "instrumentation connection closed");
                break;
            }
            Err(err) => {
                tracing::warn!(target: "nightjar.cdp", error = %err, "instrumentation stream failed");
                break;
            }
        };

        match message {
            Incoming::Reply { id, result } => {
                let pending = lock(&inner.pending, "pending").remove(&id);
                let Some(pending) = pending else {
                    tracing::trace!(target: "nightjar.cdp", id, "reply for unknown command");
                    continue;
                };
                let result = result.map_err(|err| CdpError::CommandFailed {
                    method: pending.method,
                    code: err.code,
                    message: err.message,
                });
                let _ = pending.tx.send(result);
            }
            Incoming::Notification {
                method,
                params,
                session,
            } => match CdpEvent::decode(&method, params, session) {
                Ok(Some(event)) => {
                    if let CdpEvent::DetachedFromTarget { child, .. } = &event {
                        close_session(&inner, child);
                    }
                    // No receivers is fine; events before anyone subscribes are dropped.
                    let _ = inner.events.send(event);
                }
                Ok(None) => {
                    tracing::trace!(target: "nightjar.cdp", method = %method, "ignoring notification");
                }
                Err(err) => {
                    tracing::warn!(
                        target: "nightjar.cdp",
                        method = %method,
                        error = %err,
                        "malformed notification"
                    );
                }
            },
        }
    }

    let pending = std::mem::take(&mut *lock(&inner.pending, "pending"));
    for (_id, pending) in pending {
        let _ = pending.tx.send(Err(CdpError::ConnectionClosed));
    }
    inner.shutdown.cancel();
}

/// Fail every command still waiting on a session that just went away, so
/// callers resolve instead of waiting for the reply timeout.
fn close_session(inner: &Inner, session: &SessionId) {
    lock(&inner.closed_sessions, "closed_sessions").insert(session.clone());

    let orphaned: Vec<PendingCommand> = {
        let mut pending = lock(&inner.pending, "pending");
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, cmd)| cmd.session.as_ref() == Some(session))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    };
    for cmd in orphaned {
        let _ = cmd.tx.send(Err(CdpError::SessionClosed(session.clone())));
    }
}
