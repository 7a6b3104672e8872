//! The HTTP transport capability consumed by the dispatcher.
//!
//! [`Transport`] is the seam between request scheduling and the wire: it takes a fully
//! resolved request and returns either a complete response or a [`TransportError`].
//! [`ReqwestTransport`] is the production implementation; tests substitute their own.

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;
use volley_types::{ErrorKind, Method};

use crate::DispatchError;
use crate::resolved::DispatcherConfig;

/// Transport future type alias.
pub type TransportFut<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// A resolved outbound request: query already applied, body already serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

/// A fully received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// First value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Failure to obtain a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Connect(String),
    #[error("{0}")]
    Protocol(String),
}

impl TransportError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::Connect(_) => ErrorKind::ConnectionError,
            TransportError::Protocol(_) => ErrorKind::ProtocolError,
        }
    }
}

/// Sends one request. Implementations must release every resource tied to the request
/// when the returned future is dropped.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: TransportRequest) -> TransportFut<'_>;
}

/// [`Transport`] over a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    max_body_bytes: u64,
}

impl ReqwestTransport {
    pub fn new(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let client = client_builder(config)?
            .build()
            .map_err(DispatchError::Client)?;
        Ok(Self::with_client(client, config.max_body_bytes))
    }

    /// Wrap an existing client (shares its connection pool).
    #[must_use]
    pub fn with_client(client: reqwest::Client, max_body_bytes: u64) -> Self {
        Self {
            client,
            max_body_bytes,
        }
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let TransportRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self.client.request(reqwest_method(method), url);
        for (name, value) in &headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Protocol(format!("invalid header `{name}`: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Protocol(format!("invalid header `{name}`: {e}")))?;
            builder = builder.header(header_name, header_value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        if let Some(limit) = timeout {
            builder = builder.timeout(limit);
        }

        let response = builder.send().await.map_err(classify_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        if let Some(length) = response.content_length()
            && length > self.max_body_bytes
        {
            return Err(body_too_large(self.max_body_bytes));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_error)?;
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(body_too_large(self.max_body_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: TransportRequest) -> TransportFut<'_> {
        Box::pin(self.execute(request))
    }
}

fn client_builder(config: &DispatcherConfig) -> Result<reqwest::ClientBuilder, DispatchError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(config.connect_timeout)
        .tcp_keepalive(Some(config.tcp_keepalive))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(Some(config.pool_idle_timeout));

    if let Some(proxy) = &config.proxy {
        let mut reqwest_proxy =
            reqwest::Proxy::all(proxy.url.as_str()).map_err(|e| DispatchError::InvalidConfig {
                field: "http.proxy.url",
                reason: e.to_string(),
            })?;
        if let Some(username) = &proxy.username {
            reqwest_proxy =
                reqwest_proxy.basic_auth(username, proxy.password.as_deref().unwrap_or(""));
        }
        builder = builder.proxy(reqwest_proxy);
    }

    if config.accept_invalid_certs {
        tracing::warn!(
            "accept_invalid_certs is enabled: TLS certificate validation is disabled for all requests"
        );
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder)
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

fn classify_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    let detail = error_chain(&err);
    if err.is_body() || err.is_decode() || err.is_redirect() || err.is_builder() {
        TransportError::Protocol(detail)
    } else {
        TransportError::Connect(detail)
    }
}

/// reqwest's top-level message is terse; the useful detail is in the source chain.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn body_too_large(limit: u64) -> TransportError {
    TransportError::Protocol(format!("response body exceeds {limit} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Layer(&'static str, Option<Box<Layer>>);

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl StdError for Layer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.1.as_deref().map(|l| l as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn error_chain_joins_distinct_sources() {
        let err = Layer(
            "error sending request",
            Some(Box::new(Layer(
                "client error (Connect)",
                Some(Box::new(Layer("Connection refused (os error 111)", None))),
            ))),
        );
        assert_eq!(
            error_chain(&err),
            "error sending request: client error (Connect): Connection refused (os error 111)"
        );
    }

    #[test]
    fn error_kinds_map_to_envelope_taxonomy() {
        assert_eq!(TransportError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            TransportError::Connect("refused".into()).kind(),
            ErrorKind::ConnectionError
        );
        assert_eq!(
            TransportError::Protocol("bad frame".into()).kind(),
            ErrorKind::ProtocolError
        );
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let response = TransportResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Vec::new(),
        };
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert_eq!(response.header("etag"), None);
    }

    #[test]
    fn builds_client_from_default_config() {
        assert!(ReqwestTransport::new(&DispatcherConfig::default()).is_ok());
    }
}
