//! Concurrent HTTP request dispatch.
//!
//! # Architecture
//!
//! - [`Dispatcher`] - owns a [`Transport`], the resolved [`DispatcherConfig`] and the
//!   [`DebugSwitch`]. Cheap to clone; clones share all three.
//! - [`Dispatcher::fetch_single`] - executes one [`RequestSpec`] and returns one
//!   [`ResultEnvelope`].
//! - [`Dispatcher::fetch_requests`] - fans a slice of specs out as independent tasks under
//!   a [`ConcurrencyMode`] and an optional batch deadline, returning a [`BatchReport`]
//!   whose envelopes are in input order.
//!
//! # Error Handling
//!
//! Expected failures (timeouts, refused connections, malformed responses, cancellation)
//! never surface as `Err`; they are carried in the envelope's `exception`. A non-2xx
//! status is a response like any other. `Err` is reserved for building a dispatcher from
//! invalid configuration ([`DispatchError`]) and for JOIN_ALL batches elevated through
//! [`BatchReport::into_result`] ([`BatchError`]).
//!
//! | `exception.type` | Cause |
//! |------------------|-------|
//! | `Timeout` | Per-request timeout or batch deadline elapsed |
//! | `ConnectionError` | DNS, refused connection, TLS, other send failures |
//! | `ProtocolError` | Malformed response, body read failure, body over the size limit |
//! | `Cancelled` | Explicit cancellation through a [`CancelToken`] |
//! | `Internal` | The dispatch task itself panicked |

mod batch;
mod cancel;
mod debug;
mod resolved;
mod single;
mod transport;

#[cfg(test)]
mod test_support;

use thiserror::Error;

pub use batch::{BatchError, BatchOutcome, BatchReport};
pub use cancel::{CancelReason, CancelToken};
pub use debug::{DIAG_TARGET, DebugSwitch};
pub use resolved::{BatchDefaults, DispatcherConfig, ProxySettings, total_timeout_from_secs};
pub use single::Dispatcher;
pub use transport::{
    ReqwestTransport, Transport, TransportError, TransportFut, TransportRequest,
    TransportResponse,
};

pub use volley_types;
pub use volley_types::{
    ConcurrencyMode, ErrorKind, ExceptionInfo, Meta, Method, Params, RequestSpec, ResponseBody,
    ResultEnvelope, SpecError,
};

/// Failure to construct a dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}
