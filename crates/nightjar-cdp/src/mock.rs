use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{CdpReader, CdpWriter, DEFAULT_MAX_MESSAGE_BYTES},
    poison::lock,
    types::SessionId,
};

const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// A scripted runtime speaking the instrumentation protocol over TCP.
///
/// It understands just enough of the protocol to drive the bridge in tests:
/// every command is recorded and answered, resume-type commands emit
/// `Debugger.resumed` followed by the next queued pause for that session, and
/// helpers let a test attach and detach child sessions or inject arbitrary
/// notifications.
pub struct MockRuntime {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug, Default)]
pub struct MockRuntimeConfig {
    /// Reply delays keyed by method name. Other commands are still answered
    /// while a delayed reply is pending.
    pub delayed_replies: Vec<DelayedReply>,
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub method: String,
    pub delay: Duration,
}

/// A command as received by the mock.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedCommand {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Result(Value),
    Error { code: i64, message: String },
}

pub type Responder = Arc<dyn Fn(&RecordedCommand) -> MockReply + Send + Sync>;

impl MockRuntime {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockRuntimeConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockRuntimeConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let state = Arc::new(State::new(config, outgoing));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            let _ = run(listener, task_state, outgoing_rx, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drop the connection as if the runtime process exited.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Send a notification. Notifications emitted before the bridge connects
    /// are delivered once it does.
    pub fn emit(&self, session: Option<&SessionId>, method: &str, params: Value) {
        self.state.emit(session, method, params);
    }

    /// Announce a new child execution context on the root session.
    pub fn attach_target(&self, session: &SessionId, kind: &str, title: &str, waiting: bool) {
        self.state.emit(
            None,
            "Target.attachedToTarget",
            json!({
                "sessionId": session,
                "targetInfo": {
                    "targetId": format!("target-{session}"),
                    "type": kind,
                    "title": title,
                    "url": "",
                },
                "waitingForDebugger": waiting,
            }),
        );
    }

    /// Tear down a child session. Later commands addressed to it fail.
    pub fn detach_target(&self, session: &SessionId) {
        lock(&self.state.detached, "detached").insert(session.clone());
        self.state.emit(
            None,
            "Target.detachedFromTarget",
            json!({ "sessionId": session }),
        );
    }

    pub fn pause(&self, session: Option<&SessionId>, params: Value) {
        self.state.emit(session, "Debugger.paused", params);
    }

    /// Queue a pause to emit after the next resume, step or pause command on
    /// `session`.
    pub fn queue_pause(&self, session: Option<&SessionId>, params: Value) {
        lock(&self.state.queued_pauses, "queued_pauses")
            .entry(session.cloned())
            .or_default()
            .push_back(params);
    }

    /// Answer every command with `method` using `responder` instead of the
    /// built-in default reply.
    pub fn respond_with<F>(&self, method: &str, responder: F)
    where
        F: Fn(&RecordedCommand) -> MockReply + Send + Sync + 'static,
    {
        lock(&self.state.responders, "responders").insert(method.to_string(), Arc::new(responder));
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        lock(&self.state.commands, "commands").clone()
    }

    pub fn commands_for(&self, session: Option<&SessionId>, method: &str) -> Vec<RecordedCommand> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd.method == method && cmd.session_id.as_ref() == session)
            .collect()
    }

    /// Wait until a command with `method` arrives on `session`.
    pub async fn wait_for_command(
        &self,
        session: Option<&SessionId>,
        method: &str,
    ) -> Option<RecordedCommand> {
        self.wait_for_commands(session, method, 1)
            .await
            .and_then(|mut cmds| cmds.pop())
    }

    /// Wait until at least `count` commands with `method` arrived on `session`.
    pub async fn wait_for_commands(
        &self,
        session: Option<&SessionId>,
        method: &str,
        count: usize,
    ) -> Option<Vec<RecordedCommand>> {
        let mut changes = self.state.command_count.subscribe();
        let wait = async {
            loop {
                let found = self.commands_for(session, method);
                if found.len() >= count {
                    return Some(found);
                }
                if changes.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(DEFAULT_WAIT, wait).await.ok().flatten()
    }
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A minimal call frame payload.
pub fn call_frame(call_frame_id: &str, function_name: &str, url: &str, line: u32) -> Value {
    json!({
        "callFrameId": call_frame_id,
        "functionName": function_name,
        "location": { "scriptId": "1", "lineNumber": line, "columnNumber": 0 },
        "url": url,
        "scopeChain": [],
    })
}

/// A `Debugger.paused` payload with `reason` and the given frames.
pub fn paused(reason: &str, call_frames: Vec<Value>) -> Value {
    json!({ "reason": reason, "callFrames": call_frames, "hitBreakpoints": [] })
}

struct State {
    delayed_replies: HashMap<String, Duration>,
    outgoing: mpsc::UnboundedSender<Value>,
    commands: Mutex<Vec<RecordedCommand>>,
    command_count: watch::Sender<usize>,
    responders: Mutex<HashMap<String, Responder>>,
    queued_pauses: Mutex<HashMap<Option<SessionId>, VecDeque<Value>>>,
    detached: Mutex<HashSet<SessionId>>,
    next_breakpoint: AtomicU64,
}

impl State {
    fn new(config: MockRuntimeConfig, outgoing: mpsc::UnboundedSender<Value>) -> Self {
        let delayed_replies = config
            .delayed_replies
            .into_iter()
            .map(|entry| (entry.method, entry.delay))
            .collect();
        let (command_count, _) = watch::channel(0);
        Self {
            delayed_replies,
            outgoing,
            commands: Mutex::new(Vec::new()),
            command_count,
            responders: Mutex::new(HashMap::new()),
            queued_pauses: Mutex::new(HashMap::new()),
            detached: Mutex::new(HashSet::new()),
            next_breakpoint: AtomicU64::new(1),
        }
    }

    fn emit(&self, session: Option<&SessionId>, method: &str, params: Value) {
        let mut message = json!({ "method": method, "params": params });
        if let Some(session) = session {
            message["sessionId"] = json!(session);
        }
        let _ = self.outgoing.send(message);
    }

    fn record(&self, command: RecordedCommand) {
        let count = {
            let mut commands = lock(&self.commands, "commands");
            commands.push(command);
            commands.len()
        };
        self.command_count.send_replace(count);
    }

    fn reply_for(&self, command: &RecordedCommand) -> MockReply {
        if let Some(session) = &command.session_id {
            if lock(&self.detached, "detached").contains(session) {
                return MockReply::Error {
                    code: -32001,
                    message: format!("Session with given id not found: {session}"),
                };
            }
        }

        let responder = lock(&self.responders, "responders")
            .get(&command.method)
            .cloned();
        if let Some(responder) = responder {
            return responder(command);
        }

        let result = match command.method.as_str() {
            "Debugger.enable" => json!({ "debuggerId": "mock-debugger" }),
            "Debugger.setBreakpointByUrl" => {
                let id = self.next_breakpoint.fetch_add(1, Ordering::Relaxed);
                json!({
                    "breakpointId": format!("bp-{id}"),
                    "locations": [{
                        "scriptId": "1",
                        "lineNumber": command.params.get("lineNumber").cloned().unwrap_or(json!(0)),
                        "columnNumber": command.params.get("columnNumber").cloned().unwrap_or(json!(0)),
                    }],
                })
            }
            "Runtime.evaluate" | "Runtime.callFunctionOn" | "Debugger.evaluateOnCallFrame" => {
                json!({ "result": { "type": "undefined" } })
            }
            _ => json!({}),
        };
        MockReply::Result(result)
    }

    /// Notifications that follow the reply to `command`.
    fn follow_ups(&self, command: &RecordedCommand) -> Vec<(String, Value)> {
        let session = command.session_id.clone();
        let next_pause = || {
            lock(&self.queued_pauses, "queued_pauses")
                .get_mut(&session)
                .and_then(VecDeque::pop_front)
        };

        let mut events = Vec::new();
        match command.method.as_str() {
            "Debugger.resume" | "Debugger.stepOver" | "Debugger.stepInto" | "Debugger.stepOut" => {
                events.push(("Debugger.resumed".to_string(), json!({})));
                if let Some(pause) = next_pause() {
                    events.push(("Debugger.paused".to_string(), pause));
                }
            }
            "Debugger.pause" => {
                let pause = next_pause().unwrap_or_else(|| {
                    paused("other", vec![call_frame("pause-0", "main", "file:///app.js", 0)])
                });
                events.push(("Debugger.paused".to_string(), pause));
            }
            _ => {}
        }
        events
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    mut outgoing: mpsc::UnboundedReceiver<Value>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (socket, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => accept?,
    };
    let _ = socket.set_nodelay(true);
    let (reader, writer) = socket.into_split();

    let writer_shutdown = shutdown.clone();
    let writer_task = tokio::spawn(async move {
        let mut writer = CdpWriter::new(writer);
        loop {
            let message = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                message = outgoing.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            if writer.write_value(&message).await.is_err() {
                break;
            }
        }
    });

    let mut reader = CdpReader::new(reader, DEFAULT_MAX_MESSAGE_BYTES);
    loop {
        let value = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = reader.read_value() => res,
        };
        let Ok(Some(value)) = value else {
            break;
        };
        let Ok(command) = serde_json::from_value::<RecordedCommand>(value) else {
            continue;
        };
        state.record(command.clone());

        match state.delayed_replies.get(&command.method).copied() {
            Some(delay) => {
                let state = state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    answer(&state, &command);
                });
            }
            None => answer(&state, &command),
        }
    }

    shutdown.cancel();
    let _ = writer_task.await;
    Ok(())
}

fn answer(state: &State, command: &RecordedCommand) {
    let reply = state.reply_for(command);
    let failed = matches!(reply, MockReply::Error { .. });
    let mut message = match reply {
        MockReply::Result(result) => json!({ "id": command.id, "result": result }),
        MockReply::Error { code, message } => {
            json!({ "id": command.id, "error": { "code": code, "message": message } })
        }
    };
    if let Some(session) = &command.session_id {
        message["sessionId"] = json!(session);
    }
    let _ = state.outgoing.send(message);

    if failed {
        return;
    }
    for (method, params) in state.follow_ups(command) {
        state.emit(command.session_id.as_ref(), &method, params);
    }
}
