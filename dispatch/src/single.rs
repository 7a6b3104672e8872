//! Single-request dispatch.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::time::{self, Instant};
use url::Url;
use volley_types::{
    ErrorKind, ExceptionInfo, Meta, Params, RequestSpec, ResponseBody, ResultEnvelope,
};

use crate::DispatchError;
use crate::cancel::{CancelReason, CancelToken};
use crate::debug::{self, DebugSwitch};
use crate::resolved::DispatcherConfig;
use crate::transport::{
    ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse,
};

pub(crate) const BATCH_DEADLINE_MESSAGE: &str = "batch deadline exceeded";
const CANCELLED_MESSAGE: &str = "request cancelled";

/// Executes [`RequestSpec`]s over a [`Transport`].
///
/// Clones share the transport (and its connection pool), the configuration and the
/// debug switch.
pub struct Dispatcher<T: Transport = ReqwestTransport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    transport: T,
    config: DispatcherConfig,
    debug: DebugSwitch,
}

impl<T: Transport> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("debug", &self.inner.debug.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher over a pooled reqwest client built from `config`.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: Transport> Dispatcher<T> {
    #[must_use]
    pub fn with_transport(transport: T, config: DispatcherConfig) -> Self {
        let debug = DebugSwitch::new(config.debug);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                debug,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Toggle diagnostics for this dispatcher and all of its clones.
    pub fn set_debug(&self, enabled: bool) {
        self.inner.debug.set(enabled);
    }

    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.inner.debug.is_enabled()
    }

    #[must_use]
    pub fn debug_switch(&self) -> &DebugSwitch {
        &self.inner.debug
    }

    /// Execute one request. Always yields exactly one envelope.
    pub async fn fetch_single(&self, spec: &RequestSpec) -> ResultEnvelope {
        self.dispatch(spec, &CancelToken::new()).await
    }

    /// [`fetch_single`](Self::fetch_single) that also stops when `cancel` fires.
    pub async fn fetch_single_with_cancel(
        &self,
        spec: &RequestSpec,
        cancel: &CancelToken,
    ) -> ResultEnvelope {
        self.dispatch(spec, cancel).await
    }

    pub(crate) async fn dispatch(&self, spec: &RequestSpec, cancel: &CancelToken) -> ResultEnvelope {
        let started = Instant::now();
        let request_time = now_rfc3339();
        let switch = &self.inner.debug;
        debug::dispatch_started(switch, spec.method(), spec.url().as_str(), spec.tag());

        let outcome = match cancel.reason() {
            Some(reason) => Err(cancelled_exception(reason)),
            None => self.exchange(spec, cancel).await,
        };

        let meta = meta_for(spec, request_time, started.elapsed());
        let envelope = match outcome {
            Ok(response) => response_envelope(response, meta),
            Err(exception) => ResultEnvelope::failure(exception, meta),
        };
        debug::dispatch_finished(switch, &envelope);
        envelope
    }

    async fn exchange(
        &self,
        spec: &RequestSpec,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, ExceptionInfo> {
        let request = build_transport_request(spec, &self.inner.config)?;
        let limit = request.timeout;

        tokio::select! {
            biased;
            reason = cancel.cancelled() => Err(cancelled_exception(reason)),
            result = self.send_with_timeout(request) => {
                result.map_err(|err| transport_exception(&err, limit))
            }
        }
    }

    /// The transport is asked to honor the timeout itself; the outer timer makes it a
    /// hard bound for transports that do not.
    async fn send_with_timeout(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        match request.timeout {
            Some(limit) => time::timeout(limit, self.inner.transport.send(request))
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => self.inner.transport.send(request).await,
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn meta_for(spec: &RequestSpec, request_time: String, elapsed: Duration) -> Meta {
    Meta {
        tag: spec.tag().map(str::to_string),
        method: spec.method(),
        url: spec.url().to_string(),
        request_time,
        process_time: elapsed,
    }
}

pub(crate) fn cancelled_exception(reason: CancelReason) -> ExceptionInfo {
    match reason {
        CancelReason::Deadline => ExceptionInfo::new(ErrorKind::Timeout, BATCH_DEADLINE_MESSAGE),
        CancelReason::Requested => ExceptionInfo::new(ErrorKind::Cancelled, CANCELLED_MESSAGE),
    }
}

fn transport_exception(err: &TransportError, limit: Option<Duration>) -> ExceptionInfo {
    let message = match (err, limit) {
        (TransportError::Timeout, Some(limit)) => {
            format!("request timed out after {:.3}s", limit.as_secs_f64())
        }
        _ => err.to_string(),
    };
    ExceptionInfo::new(err.kind(), message)
}

fn build_transport_request(
    spec: &RequestSpec,
    config: &DispatcherConfig,
) -> Result<TransportRequest, ExceptionInfo> {
    let method = spec.method();
    let mut url = spec.url().clone();
    let mut headers = merge_headers(&config.default_headers, spec.headers());
    let mut body = None;

    if !spec.params().is_empty() {
        if method.sends_body() {
            let encoded = serde_json::to_vec(spec.params()).map_err(|e| {
                ExceptionInfo::new(
                    ErrorKind::ProtocolError,
                    format!("failed to encode request body: {e}"),
                )
            })?;
            if !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            body = Some(encoded);
        } else {
            append_query(&mut url, spec.params());
        }
    }

    Ok(TransportRequest {
        method,
        url,
        headers,
        body,
        timeout: spec.timeout().or(config.default_request_timeout),
    })
}

/// Defaults first, then the request's own headers; same-named defaults are dropped.
fn merge_headers(
    defaults: &[(String, String)],
    overrides: &[(String, String)],
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = defaults
        .iter()
        .filter(|(name, _)| {
            !overrides
                .iter()
                .any(|(other, _)| other.eq_ignore_ascii_case(name))
        })
        .cloned()
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}

fn append_query(url: &mut Url, params: &Params) {
    let mut pairs = url.query_pairs_mut();
    for (key, value) in params {
        match value {
            Value::Array(items) => {
                for item in items {
                    pairs.append_pair(key, &query_value(item));
                }
            }
            other => {
                pairs.append_pair(key, &query_value(other));
            }
        }
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn response_envelope(response: TransportResponse, meta: Meta) -> ResultEnvelope {
    let body = decode_body(&response);
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in response.headers {
        match headers.entry(name.to_ascii_lowercase()) {
            Entry::Occupied(mut existing) => {
                let joined = existing.get_mut();
                joined.push_str(", ");
                joined.push_str(&value);
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
    ResultEnvelope::response(response.status, headers, body, meta)
}

fn decode_body(response: &TransportResponse) -> ResponseBody {
    let is_json = response
        .header("content-type")
        .is_some_and(is_json_media_type);
    if is_json && let Ok(value) = serde_json::from_slice::<Value>(&response.body) {
        return ResponseBody::Json(value);
    }
    ResponseBody::Text(String::from_utf8_lossy(&response.body).into_owned())
}

fn is_json_media_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().to_ascii_lowercase().contains("json"))
}
