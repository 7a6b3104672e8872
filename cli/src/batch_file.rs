//! Batch file loading.
//!
//! JSON files hold either an array of requests or `{"requests": [...]}`; TOML files use
//! `[[requests]]` tables. Files without a `.toml` extension are read as JSON.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use volley_dispatch::RequestSpec;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestList {
    requests: Vec<RequestSpec>,
}

pub fn load(path: &Path) -> Result<Vec<RequestSpec>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file {}", path.display()))?;

    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let specs = if is_toml {
        parse_toml(&content)
    } else {
        parse_json(&content)
    }
    .with_context(|| format!("invalid batch file {}", path.display()))?;

    tracing::debug!(path = %path.display(), count = specs.len(), "loaded batch file");
    Ok(specs)
}

fn parse_json(content: &str) -> Result<Vec<RequestSpec>> {
    let value: Value = serde_json::from_str(content)?;
    match value {
        Value::Array(_) => Ok(serde_json::from_value(value)?),
        Value::Object(_) => Ok(serde_json::from_value::<RequestList>(value)?.requests),
        _ => bail!("expected an array of requests or an object with a `requests` array"),
    }
}

fn parse_toml(content: &str) -> Result<Vec<RequestSpec>> {
    Ok(toml::from_str::<RequestList>(content)?.requests)
}
