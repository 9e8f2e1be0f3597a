//! Client requests decoded into typed commands.
//!
//! Decoding is where argument validation happens: a request that decodes is
//! well formed, and the error string of one that does not is the message of
//! the failed response.

use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    breakpoints::BreakpointSpec,
    dap_tokio::RawRequest,
    events::ThreadId,
    exceptions::FilterRequest,
    thread::StepKind,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Initialize,
    Attach(AttachTarget),
    ConfigurationDone,
    Threads,
    Step {
        thread_id: ThreadId,
        kind: StepKind,
    },
    StackTrace {
        thread_id: ThreadId,
        start_frame: usize,
        /// `None` means every frame.
        levels: Option<usize>,
    },
    ExceptionInfo {
        thread_id: ThreadId,
    },
    SetExceptionBreakpoints(Vec<FilterRequest>),
    SetBreakpoints {
        path: String,
        breakpoints: Vec<BreakpointSpec>,
    },
    Evaluate {
        expression: String,
        frame_id: Option<i64>,
    },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    Address { host: String, port: u16 },
    Process(u32),
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadArgs {
    thread_id: Option<ThreadId>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceArgs {
    thread_id: Option<ThreadId>,
    start_frame: Option<usize>,
    levels: Option<usize>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachArgs {
    host: Option<String>,
    port: Option<i64>,
    process_id: Option<i64>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionBreakpointArgs {
    #[serde(default)]
    filters: Vec<String>,
    #[serde(default)]
    filter_options: Vec<FilterOption>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterOption {
    filter_id: String,
    condition: Option<String>,
}

#[derive(Default, Deserialize)]
struct SetBreakpointsArgs {
    #[serde(default)]
    source: SourceArg,
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Default, Deserialize)]
struct SourceArg {
    path: Option<String>,
}

#[derive(Deserialize)]
struct SourceBreakpoint {
    line: u32,
    column: Option<u32>,
    condition: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArgs {
    expression: Option<String>,
    frame_id: Option<i64>,
}

impl Command {
    pub fn decode(request: &RawRequest) -> Result<Self, String> {
        let command = request.command.as_str();
        if let Some(kind) = StepKind::from_command(command) {
            let args: ThreadArgs = arguments(request)?;
            return Ok(Command::Step {
                thread_id: required_thread(command, args.thread_id)?,
                kind,
            });
        }

        Ok(match command {
            "initialize" => Command::Initialize,
            "configurationDone" => Command::ConfigurationDone,
            "threads" => Command::Threads,
            "disconnect" => Command::Disconnect,
            "attach" => Command::Attach(attach_target(arguments(request)?)?),
            "stackTrace" => {
                let args: StackTraceArgs = arguments(request)?;
                Command::StackTrace {
                    thread_id: required_thread(command, args.thread_id)?,
                    start_frame: args.start_frame.unwrap_or(0),
                    levels: args.levels.filter(|levels| *levels > 0),
                }
            }
            "exceptionInfo" => {
                let args: ThreadArgs = arguments(request)?;
                Command::ExceptionInfo {
                    thread_id: required_thread(command, args.thread_id)?,
                }
            }
            "setExceptionBreakpoints" => {
                Command::SetExceptionBreakpoints(filter_requests(arguments(request)?))
            }
            "setBreakpoints" => {
                let args: SetBreakpointsArgs = arguments(request)?;
                let path = args
                    .source
                    .path
                    .ok_or_else(|| "setBreakpoints.source.path is required".to_string())?;
                Command::SetBreakpoints {
                    path,
                    breakpoints: args
                        .breakpoints
                        .into_iter()
                        .map(|bp| BreakpointSpec {
                            line: bp.line,
                            column: bp.column,
                            condition: bp.condition,
                        })
                        .collect(),
                }
            }
            "evaluate" => {
                let args: EvaluateArgs = arguments(request)?;
                Command::Evaluate {
                    expression: args
                        .expression
                        .ok_or_else(|| "evaluate.expression is required".to_string())?,
                    frame_id: args.frame_id,
                }
            }
            other => return Err(format!("unsupported request {other}")),
        })
    }
}

/// Absent arguments decode as the all-default value.
fn arguments<T: DeserializeOwned + Default>(request: &RawRequest) -> Result<T, String> {
    if request.arguments.is_null() {
        return Ok(T::default());
    }
    T::deserialize(&request.arguments)
        .map_err(|err| format!("invalid {} arguments: {err}", request.command))
}

fn required_thread(command: &str, thread_id: Option<ThreadId>) -> Result<ThreadId, String> {
    thread_id.ok_or_else(|| format!("{command}.threadId is required"))
}

fn attach_target(args: AttachArgs) -> Result<AttachTarget, String> {
    if let Some(pid) = args.process_id {
        let pid = u32::try_from(pid).map_err(|_| format!("invalid processId {pid}"))?;
        return Ok(AttachTarget::Process(pid));
    }
    let port = args
        .port
        .ok_or_else(|| "attach.port is required".to_string())?;
    Ok(AttachTarget::Address {
        host: args.host.unwrap_or_else(|| "127.0.0.1".to_string()),
        port: u16::try_from(port).map_err(|_| format!("invalid port {port}"))?,
    })
}

/// `filters` merged with `filterOptions`; an option's condition wins over a
/// bare id.
fn filter_requests(args: ExceptionBreakpointArgs) -> Vec<FilterRequest> {
    let mut requests: Vec<FilterRequest> =
        args.filters.into_iter().map(FilterRequest::new).collect();
    for option in args.filter_options {
        requests.retain(|req| req.filter_id != option.filter_id);
        requests.push(FilterRequest {
            filter_id: option.filter_id,
            condition: option.condition,
        });
    }
    requests
}
