//! Uniform outcome records.
//!
//! Every dispatched request produces exactly one [`ResultEnvelope`]. An envelope carries
//! either a received response (`http_status`, `headers`, `body`) or an [`ExceptionInfo`]
//! describing why no response was obtained, never both. HTTP error statuses are
//! responses, not exceptions.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::Method;

/// Why a request did not complete with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Exceeded its own timeout or the batch deadline.
    Timeout,
    /// DNS, refused connection, TLS or other send failure.
    ConnectionError,
    /// Malformed or unexpected response framing.
    ProtocolError,
    /// Aborted by explicit cancellation.
    Cancelled,
    /// The dispatch task itself failed.
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{type, message}` record of a failed dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

impl ExceptionInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Payload of a received response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// Body of a JSON response, parsed.
    Json(Value),
    /// Any other body, decoded as (lossy) UTF-8.
    Text(String),
}

impl ResponseBody {
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            ResponseBody::Json(_) => None,
        }
    }
}

/// Correlation and timing data attached to every envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Meta {
    /// Caller-supplied tag, echoed verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub method: Method,
    pub url: String,
    /// RFC 3339 UTC wall-clock time at which the dispatch started.
    pub request_time: String,
    /// Elapsed time of the dispatch, serialized as fractional seconds.
    #[serde(serialize_with = "serialize_secs")]
    pub process_time: Duration,
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Immutable outcome record for one dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<ResponseBody>,
    meta: Meta,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<ExceptionInfo>,
}

impl ResultEnvelope {
    /// Envelope for a received response, whatever its status.
    #[must_use]
    pub fn response(
        status: u16,
        headers: BTreeMap<String, String>,
        body: ResponseBody,
        meta: Meta,
    ) -> Self {
        Self {
            http_status: Some(status),
            headers: Some(headers),
            body: Some(body),
            meta,
            exception: None,
        }
    }

    /// Envelope for a request that produced no response.
    #[must_use]
    pub fn failure(exception: ExceptionInfo, meta: Meta) -> Self {
        Self {
            http_status: None,
            headers: None,
            body: None,
            meta,
            exception: Some(exception),
        }
    }

    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    #[must_use]
    pub fn headers(&self) -> Option<&BTreeMap<String, String>> {
        self.headers.as_ref()
    }

    #[must_use]
    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.meta.tag.as_deref()
    }

    #[must_use]
    pub fn exception(&self) -> Option<&ExceptionInfo> {
        self.exception.as_ref()
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.exception.as_ref().map(|e| e.kind)
    }

    /// True when a response was received, regardless of its status code.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exception.is_none()
    }

    /// Serialize to the JSON envelope shape.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
