//! Seam between runtime call frames and client stack frames.
//!
//! Real source-map resolution lives outside this crate; the adapter only needs
//! something that maps a generated location to a client path and position.

use std::path::Path;

use nightjar_cdp::CallFrame;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedLocation {
    pub path: Option<String>,
    /// 1-based.
    pub line: u32,
    /// 1-based.
    pub column: u32,
}

pub trait SourceMapper: Send + Sync {
    fn map_frame(&self, frame: &CallFrame) -> MappedLocation;

    /// The runtime URL breakpoints for a client path are installed under.
    fn url_for_path(&self, path: &str) -> String;
}

/// Maps `file://` URLs to paths and converts 0-based runtime positions to the
/// client's 1-based ones. Anything that is not a file URL is passed through.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl SourceMapper for IdentityMapper {
    fn map_frame(&self, frame: &CallFrame) -> MappedLocation {
        let path = if frame.url.is_empty() {
            None
        } else {
            Some(
                frame
                    .url
                    .strip_prefix("file://")
                    .unwrap_or(&frame.url)
                    .to_string(),
            )
        };
        MappedLocation {
            path,
            line: frame.location.line_number + 1,
            column: frame.location.column_number.unwrap_or(0) + 1,
        }
    }

    fn url_for_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("file://{path}")
        } else {
            path.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub line: u32,
    pub column: u32,
}

impl StackFrame {
    pub fn new(id: i64, frame: &CallFrame, mapper: &dyn SourceMapper) -> Self {
        let mapped = mapper.map_frame(frame);
        let name = if frame.function_name.is_empty() {
            "<anonymous>".to_string()
        } else {
            frame.function_name.clone()
        };
        let source = mapped.path.map(|path| Source {
            name: Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone()),
            path: Some(path),
        });
        Self {
            id,
            name,
            source,
            line: mapped.line,
            column: mapped.column,
        }
    }
}
