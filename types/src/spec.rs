//! Request descriptors.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::Method;

/// Request parameters: query parameters for GET-like verbs, a JSON object body otherwise.
pub type Params = serde_json::Map<String, Value>;

/// Contract violations detected while building a [`RequestSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("url must not be empty or whitespace-only")]
    EmptyUrl,
    #[error("failed to parse url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme `{0}` (expected http or https)")]
    UnsupportedScheme(String),
    #[error("unsupported HTTP method `{0}`")]
    UnsupportedMethod(String),
    #[error("invalid header name `{0}`")]
    InvalidHeaderName(String),
    #[error("invalid value for header `{0}`")]
    InvalidHeaderValue(String),
    #[error("timeout must be a positive, finite duration (got {0})")]
    InvalidTimeout(String),
}

/// Immutable description of one outbound HTTP call.
///
/// Built with [`RequestSpec::new`] and the `with_*` methods; every builder step
/// validates its input, so a constructed spec is always dispatchable.
///
/// ```ignore
/// let spec = RequestSpec::new("https://example.test/items")?
///     .with_method(Method::Post)
///     .with_param("name", "widget")
///     .with_header("X-Client-Version", "1.0")?
///     .with_timeout(Duration::from_secs(3))?
///     .with_tag("create-widget");
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRequestSpec")]
pub struct RequestSpec {
    url: Url,
    method: Method,
    params: Params,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    tag: Option<String>,
}

impl RequestSpec {
    /// Create a GET request for an absolute `http`/`https` URL.
    pub fn new(url: impl AsRef<str>) -> Result<Self, SpecError> {
        let raw = url.as_ref().trim();
        if raw.is_empty() {
            return Err(SpecError::EmptyUrl);
        }

        let parsed = Url::parse(raw).map_err(|e| SpecError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SpecError::UnsupportedScheme(parsed.scheme().to_string()));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(SpecError::InvalidUrl {
                url: raw.to_string(),
                reason: "url has no host".to_string(),
            });
        }

        Ok(Self {
            url: parsed,
            method: Method::Get,
            params: Params::new(),
            headers: Vec::new(),
            timeout: None,
            tag: None,
        })
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Replace all params.
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add a header. A header with the same name (case-insensitive) is replaced.
    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, SpecError> {
        let name = name.into();
        let value = value.into();
        validate_header(&name, &value)?;

        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            *existing = (name, value);
        } else {
            self.headers.push((name, value));
        }
        Ok(self)
    }

    pub fn with_headers<I, K, V>(self, headers: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        headers
            .into_iter()
            .try_fold(self, |spec, (name, value)| spec.with_header(name, value))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, SpecError> {
        if timeout.is_zero() {
            return Err(SpecError::InvalidTimeout(format!("{timeout:?}")));
        }
        self.timeout = Some(timeout);
        Ok(self)
    }

    /// Per-request timeout in (fractional) seconds.
    pub fn with_timeout_secs(self, seconds: f64) -> Result<Self, SpecError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(SpecError::InvalidTimeout(seconds.to_string()));
        }
        let timeout = Duration::try_from_secs_f64(seconds)
            .map_err(|_| SpecError::InvalidTimeout(seconds.to_string()))?;
        self.with_timeout(timeout)
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

/// Boundary shape accepted from JSON/TOML batch files.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequestSpec {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Params>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
    /// Seconds.
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    tag: Option<String>,
}

impl TryFrom<RawRequestSpec> for RequestSpec {
    type Error = SpecError;

    fn try_from(raw: RawRequestSpec) -> Result<Self, Self::Error> {
        let mut spec = RequestSpec::new(&raw.url)?;
        if let Some(method) = raw.method {
            spec = spec.with_method(method.parse()?);
        }
        if let Some(params) = raw.params {
            spec = spec.with_params(params);
        }
        if let Some(headers) = raw.headers {
            spec = spec.with_headers(headers)?;
        }
        if let Some(seconds) = raw.timeout {
            spec = spec.with_timeout_secs(seconds)?;
        }
        if let Some(tag) = raw.tag {
            spec = spec.with_tag(tag);
        }
        Ok(spec)
    }
}

/// Check a header name (RFC 9110 token) and value (no control characters but tab).
pub fn validate_header(name: &str, value: &str) -> Result<(), SpecError> {
    if !is_valid_header_name(name) {
        return Err(SpecError::InvalidHeaderName(name.to_string()));
    }
    if !is_valid_header_value(value) {
        return Err(SpecError::InvalidHeaderValue(name.to_string()));
    }
    Ok(())
}

fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

fn is_valid_header_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}
