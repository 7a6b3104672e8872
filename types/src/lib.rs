//! Core domain types for Volley.
//!
//! This crate contains the request descriptors and result envelopes shared by the
//! dispatcher and its callers. It performs no IO and has no async code.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod envelope;
mod spec;

pub use envelope::{ErrorKind, ExceptionInfo, Meta, ResponseBody, ResultEnvelope};
pub use spec::{Params, RequestSpec, SpecError, validate_header};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// HTTP Method
// ============================================================================

/// HTTP verb of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Delete,
        Method::Head,
        Method::Options,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    /// Whether params travel as a JSON body rather than as query parameters.
    #[must_use]
    pub const fn sends_body(self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Patch | Method::Delete
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Method::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| SpecError::UnsupportedMethod(trimmed.to_string()))
    }
}

// ============================================================================
// Concurrency Mode
// ============================================================================

/// How a batch tolerates partial failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyMode {
    /// Best-effort: every member reports its own outcome, the batch never fails.
    #[default]
    SelectAll,
    /// All-or-nothing: any member failure fails the batch.
    JoinAll,
}

impl ConcurrencyMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConcurrencyMode::SelectAll => "SELECT_ALL",
            ConcurrencyMode::JoinAll => "JOIN_ALL",
        }
    }
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown concurrency mode `{0}` (expected SELECT_ALL or JOIN_ALL)")]
pub struct UnknownModeError(pub String);

impl FromStr for ConcurrencyMode {
    type Err = UnknownModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_uppercase();
        match normalized.as_str() {
            "SELECT_ALL" => Ok(ConcurrencyMode::SelectAll),
            "JOIN_ALL" => Ok(ConcurrencyMode::JoinAll),
            _ => Err(UnknownModeError(s.trim().to_string())),
        }
    }
}
