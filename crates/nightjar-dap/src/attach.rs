//! Locating the inspector endpoint of an already running process.

use std::{io, path::PathBuf, sync::OnceLock};

use regex::Regex;
use thiserror::Error;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9229;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectorAddress {
    pub address: Option<String>,
    pub port: Option<u16>,
}

fn inspect_flag() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"--inspect(-brk)?(=((\[[0-9a-fA-F:]*\]|[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+|[a-zA-Z0-9\.]*):)?(\d+))?",
        )
        .expect("valid regex")
    })
}

fn inspect_port_flag() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"--inspect-port=(\d+)").expect("valid regex")
    })
}

/// Extract the inspector address and port from a raw command line.
///
/// `--inspect` and `--inspect-brk` default to `127.0.0.1:9229` and may carry
/// `=port` or `=host:port`. `--inspect-port=N` overrides the port only.
pub fn analyse_arguments(args: &str) -> InspectorAddress {
    let mut found = InspectorAddress::default();

    if let Some(captures) = inspect_flag().captures(args) {
        found.address = Some(DEFAULT_ADDRESS.to_string());
        found.port = Some(DEFAULT_PORT);
        if let Some(host) = captures.get(4).filter(|m| !m.as_str().is_empty()) {
            found.address = Some(host.as_str().to_string());
        }
        if let Some(port) = captures.get(5) {
            found.port = port.as_str().parse().ok();
        }
    }

    if let Some(captures) = inspect_port_flag().captures(args) {
        found.port = captures.get(1).and_then(|m| m.as_str().parse().ok());
        if found.address.is_none() {
            found.address = Some(DEFAULT_ADDRESS.to_string());
        }
    }

    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// 0 when unknown.
    pub ppid: u32,
    pub command: String,
    pub args: String,
}

impl ProcessEntry {
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args)
        }
    }
}

pub trait ProcessTree: Send + Sync {
    fn lookup(&self) -> io::Result<Vec<ProcessEntry>>;

    /// `None` when the platform cannot tell.
    fn working_directory(&self, pid: u32) -> Option<PathBuf>;
}

/// Process table of the machine the adapter runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProcessTree;

#[cfg(target_os = "linux")]
impl ProcessTree for HostProcessTree {
    fn lookup(&self) -> io::Result<Vec<ProcessEntry>> {
        let mut processes = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may exit while the table is being read.
            if let Some(process) = read_proc_entry(pid) {
                processes.push(process);
            }
        }
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    fn working_directory(&self, pid: u32) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/{pid}/cwd")).ok()
    }
}

#[cfg(target_os = "linux")]
fn read_proc_entry(pid: u32) -> Option<ProcessEntry> {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let mut parts = cmdline
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned());
    let command = parts.next().unwrap_or_default();
    let args = parts.collect::<Vec<_>>().join(" ");

    // The command name in `stat` is parenthesised and may contain spaces.
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let ppid = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().nth(1))
        .and_then(|field| field.parse().ok())
        .unwrap_or(0);

    Some(ProcessEntry {
        pid,
        ppid,
        command,
        args,
    })
}

#[cfg(not(target_os = "linux"))]
impl ProcessTree for HostProcessTree {
    fn lookup(&self) -> io::Result<Vec<ProcessEntry>> {
        Ok(Vec::new())
    }

    fn working_directory(&self, _pid: u32) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("process {0} not found")]
    ProcessNotFound(u32),

    #[error("process {0} was not started with an inspector flag")]
    NoInspector(u32),

    #[error("failed to enumerate processes: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProcess {
    pub address: String,
    pub port: u16,
    pub working_directory: Option<PathBuf>,
}

/// Find where process `pid` is listening for a debugger.
pub fn resolve_process(tree: &dyn ProcessTree, pid: u32) -> Result<ResolvedProcess, AttachError> {
    let process = tree
        .lookup()?
        .into_iter()
        .find(|p| p.pid == pid)
        .ok_or(AttachError::ProcessNotFound(pid))?;
    let found = analyse_arguments(&process.command_line());
    let port = found.port.ok_or(AttachError::NoInspector(pid))?;
    Ok(ResolvedProcess {
        address: found
            .address
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
        port,
        working_directory: tree.working_directory(pid),
    })
}
