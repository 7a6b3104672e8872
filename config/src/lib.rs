//! Configuration loading for Volley.
//!
//! The configuration file lives at `~/.volley/config.toml` unless `VOLLEY_CONFIG` points
//! elsewhere. Every section and key is optional; defaults are applied when the
//! dispatcher resolves the configuration, not here.
//!
//! ```toml
//! [http]
//! user_agent = "volley/0.1"
//! connect_timeout_seconds = 10
//! request_timeout_seconds = 30
//!
//! [http.headers]
//! Authorization = "Bearer ${API_TOKEN}"
//!
//! [http.proxy]
//! url = "http://proxy.internal:3128"
//!
//! [debug]
//! enabled = true
//!
//! [batch]
//! mode = "JOIN_ALL"
//! total_timeout_seconds = 5.0
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "VOLLEY_CONFIG";
/// Environment variable forcing the debug switch on or off.
pub const DEBUG_ENV: &str = "VOLLEY_DEBUG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolleyConfig {
    pub http: Option<HttpConfig>,
    pub debug: Option<DebugConfig>,
    pub batch: Option<BatchConfig>,
}

/// `[http]` section: transport and client settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    pub user_agent: Option<String>,
    pub connect_timeout_seconds: Option<f64>,
    /// Applied to requests that carry no timeout of their own.
    pub request_timeout_seconds: Option<f64>,
    pub pool_max_idle_per_host: Option<usize>,
    pub pool_idle_timeout_seconds: Option<u64>,
    pub tcp_keepalive_seconds: Option<u64>,
    pub max_body_bytes: Option<u64>,
    /// Disable TLS certificate validation (testing only).
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Default headers; values support `${VAR}` expansion.
    pub headers: Option<BTreeMap<String, String>>,
    pub proxy: Option<ProxyConfig>,
}

impl HttpConfig {
    /// Default headers with environment variables expanded.
    #[must_use]
    pub fn expanded_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .flatten()
            .map(|(name, value)| (name.clone(), expand_env_vars(value)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// `[batch]` section: defaults for callers that do not pass their own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    pub mode: Option<String>,
    pub total_timeout_seconds: Option<f64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl VolleyConfig {
    /// Load the config file from its default location.
    ///
    /// Returns `Ok(None)` when no config file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Self::from_toml_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.enabled)
    }
}

/// Location of the config file: `$VOLLEY_CONFIG`, else `~/.volley/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".volley").join("config.toml"))
}

/// Debug switch override from `VOLLEY_DEBUG`, if set to a recognizable value.
#[must_use]
pub fn debug_override_from_env() -> Option<bool> {
    env::var(DEBUG_ENV).ok().and_then(|v| parse_flag(&v))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Replace `${VAR}` occurrences with the variable's value (empty when unset).
///
/// An unterminated `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}
