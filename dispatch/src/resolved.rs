//! Configuration resolution.
//!
//! Turns the optional, loosely typed [`VolleyConfig`] loaded from disk into a
//! [`DispatcherConfig`] with concrete values. Validation happens once here; the
//! dispatcher and transport never see an `Option` they have to default themselves.
//!
//! ```ignore
//! let config = VolleyConfig::load()?.unwrap_or_default();
//! let resolved = DispatcherConfig::from_config(&config)?.with_env_overrides();
//! let dispatcher = Dispatcher::new(resolved)?;
//! ```

use std::time::Duration;

use url::Url;
use volley_config::{BatchConfig, HttpConfig, ProxyConfig, VolleyConfig, debug_override_from_env};
use volley_types::{ConcurrencyMode, validate_header};

use crate::DispatchError;

pub(crate) const DEFAULT_USER_AGENT: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT_SECS: u64 = 30;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// Proxy routing for every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Defaults used by callers that do not pick a mode or deadline themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchDefaults {
    pub mode: ConcurrencyMode,
    pub total_timeout: Option<Duration>,
}

/// Fully resolved dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    /// Applied to specs without their own timeout.
    pub default_request_timeout: Option<Duration>,
    /// Sent with every request; a request header of the same name wins.
    pub default_headers: Vec<(String, String)>,
    pub proxy: Option<ProxySettings>,
    pub accept_invalid_certs: bool,
    pub max_body_bytes: u64,
    /// Initial state of the debug switch.
    pub debug: bool,
    pub batch: BatchDefaults,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            tcp_keepalive: Duration::from_secs(TCP_KEEPALIVE_SECS),
            pool_max_idle_per_host: POOL_MAX_IDLE_PER_HOST,
            pool_idle_timeout: Duration::from_secs(POOL_IDLE_TIMEOUT_SECS),
            default_request_timeout: None,
            default_headers: Vec::new(),
            proxy: None,
            accept_invalid_certs: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            debug: false,
            batch: BatchDefaults::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &VolleyConfig) -> Result<Self, DispatchError> {
        let mut resolved = Self {
            debug: config.debug_enabled(),
            ..Self::default()
        };

        if let Some(http) = &config.http {
            resolved.apply_http(http)?;
        }
        if let Some(batch) = &config.batch {
            resolved.batch = resolve_batch(batch)?;
        }

        Ok(resolved)
    }

    /// Apply `VOLLEY_DEBUG`, which takes precedence over the config file.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(enabled) = debug_override_from_env() {
            self.debug = enabled;
        }
        self
    }

    fn apply_http(&mut self, http: &HttpConfig) -> Result<(), DispatchError> {
        if let Some(user_agent) = http.user_agent.as_ref().filter(|s| !s.trim().is_empty()) {
            self.user_agent.clone_from(user_agent);
        }
        if let Some(seconds) = http.connect_timeout_seconds {
            self.connect_timeout = positive_secs("http.connect_timeout_seconds", seconds)?;
        }
        if let Some(seconds) = http.request_timeout_seconds {
            self.default_request_timeout =
                Some(positive_secs("http.request_timeout_seconds", seconds)?);
        }
        if let Some(max_idle) = http.pool_max_idle_per_host {
            self.pool_max_idle_per_host = max_idle;
        }
        if let Some(seconds) = http.pool_idle_timeout_seconds {
            self.pool_idle_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = http.tcp_keepalive_seconds {
            self.tcp_keepalive = Duration::from_secs(seconds);
        }
        if let Some(limit) = http.max_body_bytes {
            if limit == 0 {
                return Err(DispatchError::InvalidConfig {
                    field: "http.max_body_bytes",
                    reason: "must be greater than zero".to_string(),
                });
            }
            self.max_body_bytes = limit;
        }
        self.accept_invalid_certs = http.accept_invalid_certs;

        let headers = http.expanded_headers();
        for (name, value) in &headers {
            validate_header(name, value).map_err(|e| DispatchError::InvalidConfig {
                field: "http.headers",
                reason: e.to_string(),
            })?;
        }
        self.default_headers = headers;

        if let Some(proxy) = &http.proxy {
            self.proxy = Some(resolve_proxy(proxy)?);
        }
        Ok(())
    }
}

fn resolve_proxy(proxy: &ProxyConfig) -> Result<ProxySettings, DispatchError> {
    let parsed = Url::parse(proxy.url.trim()).map_err(|e| DispatchError::InvalidConfig {
        field: "http.proxy.url",
        reason: format!("`{}`: {e}", proxy.url),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DispatchError::InvalidConfig {
            field: "http.proxy.url",
            reason: format!("unsupported proxy scheme `{}`", parsed.scheme()),
        });
    }
    Ok(ProxySettings {
        url: parsed.to_string(),
        username: proxy.username.clone(),
        password: proxy.password.clone(),
    })
}

fn resolve_batch(batch: &BatchConfig) -> Result<BatchDefaults, DispatchError> {
    let mode = match &batch.mode {
        Some(raw) => raw.parse().map_err(|e| DispatchError::InvalidConfig {
            field: "batch.mode",
            reason: format!("{e}"),
        })?,
        None => ConcurrencyMode::default(),
    };
    Ok(BatchDefaults {
        mode,
        total_timeout: batch.total_timeout_seconds.and_then(total_timeout_from_secs),
    })
}

fn positive_secs(field: &'static str, seconds: f64) -> Result<Duration, DispatchError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(DispatchError::InvalidConfig {
            field,
            reason: format!("must be a positive number of seconds (got {seconds})"),
        });
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| DispatchError::InvalidConfig {
        field,
        reason: e.to_string(),
    })
}

/// Batch deadline from loosely typed seconds.
///
/// Negative and NaN values clamp to zero (expire immediately); infinity means no deadline.
#[must_use]
pub fn total_timeout_from_secs(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() || seconds <= 0.0 {
        return Some(Duration::ZERO);
    }
    Duration::try_from_secs_f64(seconds).ok()
}
