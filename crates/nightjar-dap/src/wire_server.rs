use std::{net::SocketAddr, sync::Arc};

use nightjar_cdp::{CdpClient, CdpClientConfig};
use nightjar_config::NightjarConfig;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    attach::{resolve_process, HostProcessTree, ProcessTree},
    breakpoints::{BreakpointSpec, BreakpointStore},
    condition::ConditionValidator,
    dap_tokio::{DapError, DapReader, DapWriter, Incoming, Outgoing, RawRequest},
    events::{AdapterEvent, EventSink, OutputCategory, ThreadId},
    exceptions::{ExceptionBreakpoints, FilterId, FilterRequest},
    requests::{AttachTarget, Command},
    source_map::{IdentityMapper, SourceMapper},
    targets::{TargetTree, TargetTreeOptions},
    thread::StepKind,
};

#[derive(Debug, Error)]
pub enum WireServerError {
    #[error(transparent)]
    Dap(#[from] DapError),
}

type Result<T> = std::result::Result<T, WireServerError>;

/// Knobs the server needs from the configuration file, plus the seams tests
/// replace.
#[derive(Clone)]
pub struct AdapterOptions {
    pub cdp: CdpClientConfig,
    pub condition_identifier: String,
    pub default_exception_filters: Vec<String>,
    pub process_tree: Arc<dyn ProcessTree>,
    pub mapper: Arc<dyn SourceMapper>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self::from_config(&NightjarConfig::default())
    }
}

impl AdapterOptions {
    pub fn from_config(config: &NightjarConfig) -> Self {
        Self {
            cdp: CdpClientConfig {
                connect_timeout: config.cdp.connect_timeout(),
                reply_timeout: config.cdp.reply_timeout(),
                event_channel_size: config.cdp.event_channel_size,
                max_message_bytes: config.cdp.max_message_bytes,
            },
            condition_identifier: config.adapter.condition_identifier.clone(),
            default_exception_filters: config.adapter.default_exception_filters.clone(),
            process_tree: Arc::new(HostProcessTree),
            mapper: Arc::new(IdentityMapper),
        }
    }
}

/// Run the adapter over stdio.
pub async fn run_stdio(options: AdapterOptions) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, options).await.map_err(anyhow::Error::from)
}

pub async fn run<R, W>(reader: R, writer: W, options: AdapterOptions) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        while let Some(msg) = out_rx.recv().await {
            if let Err(err) = writer.send(&msg).await {
                tracing::warn!(target: "nightjar.dap", error = %err, "failed to write to client");
            }
        }
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let event_task = spawn_event_task(events_rx, out_tx.clone());

    let mut server = Server::new(options, out_tx.clone(), events_tx);
    let mut reader = DapReader::new(reader);

    let outcome = loop {
        let request = match reader.read_message().await {
            Ok(Some(Incoming::Request(request))) => request,
            Ok(Some(Incoming::Other)) => continue,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        tracing::debug!(target: "nightjar.dap", command = %request.command, seq = request.seq, "request");

        match Command::decode(&request) {
            Ok(Command::Disconnect) => {
                let _ = out_tx.send(Outgoing::success(&request, None));
                break Ok(());
            }
            Ok(command) => server.handle(&request, command).await,
            Err(message) => server.reply(&request, Err(message)),
        }
    };

    server.finish().await;
    drop(server);
    let _ = event_task.await;
    drop(out_tx);
    let _ = writer_task.await;

    outcome.map_err(WireServerError::from)
}

struct Server {
    options: AdapterOptions,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    events: EventSink,
    validator: ConditionValidator,
    exceptions: ExceptionBreakpoints,
    breakpoints: Arc<BreakpointStore>,
    tree: Option<TargetTree>,
}

impl Server {
    fn new(
        options: AdapterOptions,
        out_tx: mpsc::UnboundedSender<Outgoing>,
        events: EventSink,
    ) -> Self {
        let validator = ConditionValidator::new(options.condition_identifier.clone());
        let exceptions = ExceptionBreakpoints::new(validator.clone());
        let defaults: Vec<FilterRequest> = options
            .default_exception_filters
            .iter()
            .map(FilterRequest::new)
            .collect();
        exceptions.set_filters(&defaults);

        Self {
            options,
            out_tx,
            events,
            exceptions,
            breakpoints: Arc::new(BreakpointStore::new(validator.clone())),
            validator,
            tree: None,
        }
    }

    async fn handle(&mut self, request: &RawRequest, command: Command) {
        let result = match command {
            Command::Initialize => {
                let body = capabilities(self.validator.identifier());
                self.reply(request, Ok(Some(body)));
                let _ = self.out_tx.send(Outgoing::event("initialized", None));
                return;
            }
            Command::Attach(target) => self.attach(target).await,
            Command::ConfigurationDone | Command::Disconnect => Ok(None),
            Command::Threads => Ok(Some(self.threads())),
            Command::Step { thread_id, kind } => self.step(thread_id, kind).await,
            Command::StackTrace {
                thread_id,
                start_frame,
                levels,
            } => self.stack_trace(thread_id, start_frame, levels).await,
            Command::ExceptionInfo { thread_id } => self.exception_info(thread_id).await,
            Command::SetExceptionBreakpoints(requests) => {
                Ok(Some(self.set_exception_breakpoints(&requests).await))
            }
            Command::SetBreakpoints { path, breakpoints } => {
                Ok(Some(self.set_breakpoints(&path, &breakpoints).await))
            }
            Command::Evaluate {
                expression,
                frame_id,
            } => self.evaluate(&expression, frame_id).await,
        };
        self.reply(request, result);
    }

    fn reply(&self, request: &RawRequest, result: std::result::Result<Option<Value>, String>) {
        let response = match result {
            Ok(body) => Outgoing::success(request, body),
            Err(message) => {
                tracing::debug!(
                    target: "nightjar.dap",
                    command = %request.command,
                    error = %message,
                    "request failed"
                );
                Outgoing::failure(request, message)
            }
        };
        let _ = self.out_tx.send(response);
    }

    /// Tear down the runtime connection, or report termination if there never
    /// was one.
    async fn finish(&mut self) {
        match self.tree.take() {
            Some(tree) => tree.shutdown().await,
            None => {
                let _ = self.events.send(AdapterEvent::Terminated);
            }
        }
    }

    fn tree(&self) -> std::result::Result<&TargetTree, String> {
        self.tree.as_ref().ok_or_else(|| "not attached".to_string())
    }

    async fn attach(&mut self, target: AttachTarget) -> std::result::Result<Option<Value>, String> {
        if self.tree.is_some() {
            return Err("already attached".to_string());
        }

        let (host, port) = match target {
            AttachTarget::Process(pid) => {
                let resolved = resolve_process(self.options.process_tree.as_ref(), pid)
                    .map_err(|err| err.to_string())?;
                if let Some(cwd) = &resolved.working_directory {
                    let _ = self.events.send(AdapterEvent::output(
                        OutputCategory::Console,
                        format!("Attaching to process {pid} in {}\n", cwd.display()),
                    ));
                }
                (resolved.address, resolved.port)
            }
            AttachTarget::Address { host, port } => (host, port),
        };

        let addr = resolve_addr(&host, port).await?;
        tracing::info!(target: "nightjar.dap", %addr, "attaching");
        let client = CdpClient::connect_with_config(addr, self.options.cdp.clone())
            .await
            .map_err(|err| format!("failed to connect to {addr}: {err}"))?;
        let tree = TargetTree::attach(
            client,
            self.events.clone(),
            TargetTreeOptions {
                exceptions: self.exceptions.clone(),
                breakpoints: self.breakpoints.clone(),
                mapper: self.options.mapper.clone(),
            },
        )
        .await
        .map_err(|err| err.to_string())?;
        self.tree = Some(tree);
        Ok(None)
    }

    fn threads(&self) -> Value {
        let threads: Vec<Value> = self
            .tree
            .as_ref()
            .map(|tree| tree.list_threads())
            .unwrap_or_default()
            .into_iter()
            .map(|thread| json!({ "id": thread.id, "name": thread.name }))
            .collect();
        json!({ "threads": threads })
    }

    async fn step(&self, thread_id: ThreadId, kind: StepKind) -> std::result::Result<Option<Value>, String> {
        self.tree()?
            .step(thread_id, kind)
            .await
            .map_err(|err| err.to_string())?;
        Ok(match kind {
            StepKind::Continue => Some(json!({ "allThreadsContinued": false })),
            _ => None,
        })
    }

    async fn stack_trace(
        &self,
        thread_id: ThreadId,
        start: usize,
        levels: Option<usize>,
    ) -> std::result::Result<Option<Value>, String> {
        let frames = self
            .tree()?
            .stack_trace(thread_id)
            .await
            .map_err(|err| err.to_string())?;
        let total = frames.len();
        let levels = levels.unwrap_or(total);
        let frames: Vec<_> = frames.into_iter().skip(start).take(levels).collect();
        Ok(Some(json!({ "stackFrames": frames, "totalFrames": total })))
    }

    async fn exception_info(&self, thread_id: ThreadId) -> std::result::Result<Option<Value>, String> {
        let info = self
            .tree()?
            .exception_info(thread_id)
            .await
            .map_err(|err| err.to_string())?;
        serde_json::to_value(info)
            .map(Some)
            .map_err(|err| err.to_string())
    }

    async fn set_exception_breakpoints(&self, requests: &[FilterRequest]) -> Value {
        let outcome = match &self.tree {
            Some(tree) => tree.set_exception_filters(requests).await,
            None => {
                let outcome = self.exceptions.set_filters(requests);
                for diagnostic in &outcome.diagnostics {
                    let _ = self
                        .events
                        .send(AdapterEvent::output(OutputCategory::Stderr, diagnostic.clone()));
                }
                outcome
            }
        };
        tracing::debug!(target: "nightjar.dap", state = ?outcome.pause_state, "exception filters set");

        let active = self.exceptions.snapshot();
        let breakpoints: Vec<Value> = requests
            .iter()
            .map(|req| {
                let verified = FilterId::parse(&req.filter_id)
                    .is_some_and(|id| active.filters().iter().any(|f| f.id == id));
                json!({ "verified": verified })
            })
            .collect();
        json!({ "breakpoints": breakpoints })
    }

    async fn set_breakpoints(&self, path: &str, specs: &[BreakpointSpec]) -> Value {
        let breakpoints = match &self.tree {
            Some(tree) => tree.set_breakpoints(path, specs).await,
            None => {
                let url = self.options.mapper.url_for_path(path);
                let outcome = self.breakpoints.replace(&url, specs);
                for diagnostic in &outcome.diagnostics {
                    let _ = self
                        .events
                        .send(AdapterEvent::output(OutputCategory::Stderr, diagnostic.clone()));
                }
                outcome.breakpoints
            }
        };
        json!({ "breakpoints": breakpoints })
    }

    async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> std::result::Result<Option<Value>, String> {
        let result = self
            .tree()?
            .evaluate(expression, frame_id)
            .await
            .map_err(|err| err.to_string())?;
        if let Some(details) = result.exception_details {
            return Err(details.display());
        }
        Ok(Some(json!({
            "result": result.result.display(),
            "type": result.result.kind,
            "variablesReference": 0,
        })))
    }
}

fn capabilities(identifier: &str) -> Value {
    let filters: Vec<Value> = [FilterId::All, FilterId::Uncaught]
        .into_iter()
        .map(|id| {
            json!({
                "filter": id.as_str(),
                "label": id.label(),
                "default": false,
                "supportsCondition": true,
                "conditionDescription": format!(
                    "Expression over `{identifier}`, e.g. {identifier}.message.includes(\"bye\")"
                ),
            })
        })
        .collect();
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsEvaluateForHovers": true,
        "supportsConditionalBreakpoints": true,
        "supportsExceptionInfoRequest": true,
        "supportsExceptionFilterOptions": true,
        "supportsSetVariable": false,
        "supportsStepBack": false,
        "exceptionBreakpointFilters": filters,
    })
}

async fn resolve_addr(host: &str, port: u16) -> std::result::Result<SocketAddr, String> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| format!("invalid host {host:?}: {err}"))?;
    addrs
        .next()
        .ok_or_else(|| format!("host {host:?} did not resolve"))
}

/// Forward adapter events to the client until the session terminates.
fn spawn_event_task(
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
    tx: mpsc::UnboundedSender<Outgoing>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let (name, body) = event.to_dap();
            let _ = tx.send(Outgoing::event(name, body));
            if event == AdapterEvent::Terminated {
                break;
            }
        }
    })
}
