//! Content-Length framed DAP transport over tokio I/O.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound for a single client message body.
pub const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),

    #[error("Content-Length {0} exceeds {MAX_CONTENT_LENGTH} bytes")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, DapError>;

/// A client message. The adapter never sends requests, so anything but a
/// request is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Incoming {
    Request(RawRequest),
    #[serde(other)]
    Other,
}

/// A request before its arguments are decoded; see [`crate::requests`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawRequest {
    pub seq: i64,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// A message to the client. `seq` is stamped by [`DapWriter::send`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outgoing {
    Response {
        request_seq: i64,
        command: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl Outgoing {
    pub fn success(request: &RawRequest, body: Option<Value>) -> Self {
        Outgoing::Response {
            request_seq: request.seq,
            command: request.command.clone(),
            success: true,
            message: None,
            body,
        }
    }

    pub fn failure(request: &RawRequest, message: impl Into<String>) -> Self {
        Outgoing::Response {
            request_seq: request.seq,
            command: request.command.clone(),
            success: false,
            message: Some(message.into()),
            body: None,
        }
    }

    pub fn event(event: impl Into<String>, body: Option<Value>) -> Self {
        Outgoing::Event {
            event: event.into(),
            body,
        }
    }
}

#[derive(Serialize)]
struct Stamped<'a> {
    seq: i64,
    #[serde(flatten)]
    message: &'a Outgoing,
}

pub struct DapReader<R> {
    reader: BufReader<R>,
    header: String,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            header: String::new(),
        }
    }

    /// Body length from the header block, or `None` at a clean end of stream.
    async fn content_length(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        loop {
            self.header.clear();
            if self.reader.read_line(&mut self.header).await? == 0 {
                return Ok(None);
            }
            let line = self.header.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            // Unknown headers such as Content-Type are ignored.
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("Content-Length") {
                    let value = value.trim();
                    length = Some(
                        value
                            .parse::<usize>()
                            .map_err(|_| DapError::InvalidContentLength(value.to_string()))?,
                    );
                }
            }
        }
        match length {
            Some(len) if len > MAX_CONTENT_LENGTH => Err(DapError::TooLarge(len)),
            Some(len) => Ok(Some(len)),
            None => Err(DapError::MissingContentLength),
        }
    }

    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let Some(len) = self.content_length().await? else {
            return Ok(None);
        };
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub async fn read_message(&mut self) -> Result<Option<Incoming>> {
        match self.read_value().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

pub struct DapWriter<W> {
    writer: W,
    next_seq: i64,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_seq: 1,
        }
    }

    /// Frame `message` with the next outgoing sequence number.
    pub async fn send(&mut self, message: &Outgoing) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let body = serde_json::to_vec(&Stamped { seq, message })?;
        self.write_frame(&body).await
    }

    /// Frame an already complete message.
    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.write_frame(&body).await
    }

    async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
