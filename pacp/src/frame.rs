//! Newline-delimited JSON-RPC 2.0 frame codec.
//!
//! Every P/ACP transport carries one complete JSON-RPC 2.0 object per
//! line, UTF-8 encoded, no batching. Frames classify into requests,
//! notifications (requests without an id), and responses; anything else
//! is invalid and — at the pipeline level — fatal.
//!
//! Forwarded payloads stay as [`serde_json::Value`] throughout so the
//! conductor only inspects the handful of fields it needs. `serde_json`
//! is built with `preserve_order`, so untouched branches round-trip
//! without key reordering.

use std::fmt;

use futures::io::{BufReader, Lines};
use futures::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, StreamExt as _};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A JSON-RPC 2.0 request id. Only strings and integers appear on the
/// wire; the original type must be preserved exactly across id rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

/// Marker for the `"jsonrpc": "2.0"` member. Any other value fails
/// deserialization, classifying the frame as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct V2;

impl Serialize for V2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for V2 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(V2)
        } else {
            Err(D::Error::custom(format!(
                "unsupported JSON-RPC version `{version}`"
            )))
        }
    }
}

/// A request or notification. A request without an id is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: V2,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: impl Into<Id>) -> Self {
        Self {
            jsonrpc: V2,
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: V2,
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// The terminal member of a response: exactly one of `result` / `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseOutcome {
    Success { result: Value },
    Failure { error: ErrorObject },
}

/// A response to a previously sent request. `id` is `None` only for
/// generalized error responses that could not be correlated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: V2,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
    pub id: Option<Id>,
}

impl Response {
    pub fn success(result: Value, id: impl Into<Id>) -> Self {
        Self {
            jsonrpc: V2,
            outcome: ResponseOutcome::Success { result },
            id: Some(id.into()),
        }
    }

    pub fn error(error: ErrorObject, id: Option<Id>) -> Self {
        Self {
            jsonrpc: V2,
            outcome: ResponseOutcome::Failure { error },
            id,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ResponseOutcome::Success { result } => Some(result),
            ResponseOutcome::Failure { .. } => None,
        }
    }

    /// The same outcome, re-addressed. This is the id-rewriting step on
    /// the response path: the payload is untouched.
    pub fn with_id(mut self, id: Option<Id>) -> Self {
        self.id = id;
        self
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Response(_) => None,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// Codec failure. `Invalid` carries the offending line for diagnostics;
/// the pipeline treats every variant as fatal.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid frame `{line}`: {source}")]
    Invalid {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize outgoing frame: {0}")]
    Serialize(serde_json::Error),
}

/// Reads newline-delimited frames off a byte stream.
pub struct FrameReader<R: AsyncRead + Unpin> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// The next frame, or `None` on clean end of stream. Blank lines are
    /// skipped; anything else that fails to parse is an invalid frame.
    pub async fn read(&mut self) -> Option<Result<Message, FrameError>> {
        loop {
            match self.lines.next().await? {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(
                        serde_json::from_str(&line)
                            .map_err(|source| FrameError::Invalid { line, source }),
                    );
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Writes frames to a byte stream, one per line, flushing each.
pub struct FrameWriter<W: AsyncWrite + Unpin> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write(&mut self, message: &Message) -> Result<(), FrameError> {
        let mut bytes = serde_json::to_vec(message).map_err(FrameError::Serialize)?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
