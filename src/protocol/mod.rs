//! Newline-delimited JSON wire format.
//!
//! Each frame is one JSON object on one line:
//!
//! ```text
//! -> {"id":1,"method":"get_property","params":{"id":"42"},"client_id":"ops"}
//! <- {"id":1,"result":{...}}
//! <- {"id":2,"error":{"kind":"RateLimitExceeded","message":"...","retry_after_ms":59400}}
//! ```
//!
//! Responses echo the request `id` verbatim. Blank lines are ignored.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ToolError;
use crate::middleware::ToolResult;

/// Largest frame accepted, newline excluded (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors produced while decoding or encoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line is longer than [`MAX_FRAME_SIZE`]. The connection cannot be
    /// resynchronized and should be closed.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// The line was not a valid request object. It has been consumed, so the
    /// connection may continue with the next frame.
    #[error("malformed request: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}

/// An inbound tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Rate-limit identity. Filled from the peer address when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Request {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            client_id: None,
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Error payload of a failed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&ToolError> for ErrorBody {
    fn from(error: &ToolError) -> Self {
        let retry_after_ms = match error {
            ToolError::RateLimitExceeded { retry_after, .. } => {
                Some(retry_after.as_millis().min(u128::from(u64::MAX)) as u64)
            }
            _ => None,
        };
        Self {
            kind: error.kind().as_str().to_owned(),
            message: error.to_string(),
            attempts: error.attempts(),
            retry_after_ms,
        }
    }
}

/// An outbound reply; exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: &ToolError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody::from(error)),
        }
    }

    pub fn from_result(id: Value, result: ToolResult) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::failure(id, &e),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Splits a connection's read buffer into requests.
///
/// One decoder belongs to one buffer. It remembers how far the buffer has
/// already been searched for a newline, so a frame that trickles in over many
/// reads is scanned once rather than once per read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts the next request from `buf`.
    ///
    /// Returns `Ok(None)` when no complete line is buffered yet. Consumed bytes
    /// are removed from `buf`, including those of a malformed line.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        loop {
            let from = self.scanned.min(buf.len());
            let Some(offset) = buf[from..].iter().position(|b| *b == b'\n') else {
                self.scanned = buf.len();
                if buf.len() > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: buf.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                return Ok(None);
            };

            let newline = from + offset;
            self.scanned = 0;
            let line = buf.split_to(newline + 1);
            let mut body = &line[..newline];
            if let [rest @ .., b'\r'] = body {
                body = rest;
            }

            if body.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: body.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return serde_json::from_slice(body)
                .map(Some)
                .map_err(ProtocolError::Malformed);
        }
    }
}

/// Serializes `response` as one newline-terminated frame.
pub fn encode_frame(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(response).map_err(ProtocolError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}
