use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::types::{CdpError, Result, SessionId};

/// Messages are JSON objects terminated by a single NUL byte.
pub const MESSAGE_TERMINATOR: u8 = 0;

/// Default cap for a single inbound message.
///
/// Pause payloads with deep async stacks can be large, but an unbounded frame
/// would let a misbehaving runtime force arbitrary allocations.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
    #[serde(default)]
    session_id: Option<SessionId>,
}

/// An inbound message: either the reply to a command or a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Reply {
        id: u64,
        result: std::result::Result<Value, RemoteError>,
    },
    Notification {
        method: String,
        params: Value,
        session: Option<SessionId>,
    },
}

impl Incoming {
    pub fn decode(value: Value) -> Result<Self> {
        let raw: RawMessage = serde_json::from_value(value)?;
        match (raw.id, raw.method) {
            (Some(id), _) => {
                let result = match raw.error {
                    Some(err) => Err(err),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Incoming::Reply { id, result })
            }
            (None, Some(method)) => Ok(Incoming::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
                session: raw.session_id,
            }),
            (None, None) => Err(CdpError::Protocol(
                "message has neither id nor method".to_string(),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCommand<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a SessionId>,
}

pub struct CdpReader<R> {
    reader: BufReader<R>,
    max_message_bytes: usize,
}

impl<R: AsyncRead + Unpin> CdpReader<R> {
    pub fn new(inner: R, max_message_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_message_bytes,
        }
    }

    /// Read the next framed message. `Ok(None)` on a clean end of stream.
    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let mut buf = Vec::new();
        let limit = self.max_message_bytes as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(MESSAGE_TERMINATOR, &mut buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        if buf.last() != Some(&MESSAGE_TERMINATOR) {
            if buf.len() > self.max_message_bytes {
                return Err(CdpError::Protocol(format!(
                    "message exceeds {} bytes",
                    self.max_message_bytes
                )));
            }
            if buf.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            return Err(CdpError::Protocol("stream ended mid-message".to_string()));
        }

        buf.pop();
        Ok(Some(serde_json::from_slice::<Value>(&buf)?))
    }

    pub async fn read_message(&mut self) -> Result<Option<Incoming>> {
        let Some(value) = self.read_value().await? else {
            return Ok(None);
        };
        Incoming::decode(value).map(Some)
    }
}

pub struct CdpWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> CdpWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(MESSAGE_TERMINATOR);
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_command(&mut self, command: &OutgoingCommand<'_>) -> Result<()> {
        let value = serde_json::to_value(command)?;
        self.write_value(&value).await
    }
}
