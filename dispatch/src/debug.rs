//! Debug switch and diagnostic records.
//!
//! Diagnostics are `info` events on the [`DIAG_TARGET`] target, emitted only while the
//! switch is on. They never influence the envelopes a dispatch returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use volley_types::{ConcurrencyMode, Method, ResultEnvelope};

/// Tracing target for debug-switch diagnostics.
pub const DIAG_TARGET: &str = "volley::diag";

/// Shared on/off flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct DebugSwitch(Arc<AtomicBool>);

impl DebugSwitch {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Short label for an envelope: the status code or the exception type.
pub(crate) fn outcome_label(envelope: &ResultEnvelope) -> String {
    match (envelope.http_status(), envelope.exception()) {
        (Some(status), _) => status.to_string(),
        (None, Some(exception)) => exception.kind.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

pub(crate) fn dispatch_started(switch: &DebugSwitch, method: Method, url: &str, tag: Option<&str>) {
    if !switch.is_enabled() {
        return;
    }
    tracing::info!(
        target: DIAG_TARGET,
        method = %method,
        url,
        tag = tag.unwrap_or(""),
        "dispatch started"
    );
}

pub(crate) fn dispatch_finished(switch: &DebugSwitch, envelope: &ResultEnvelope) {
    if !switch.is_enabled() {
        return;
    }
    let meta = envelope.meta();
    let outcome = outcome_label(envelope);
    match envelope.exception() {
        Some(exception) => tracing::info!(
            target: DIAG_TARGET,
            method = %meta.method,
            url = %meta.url,
            elapsed_ms = meta.process_time.as_millis() as u64,
            outcome = %outcome,
            error = %exception.message,
            "dispatch finished"
        ),
        None => tracing::info!(
            target: DIAG_TARGET,
            method = %meta.method,
            url = %meta.url,
            elapsed_ms = meta.process_time.as_millis() as u64,
            outcome = %outcome,
            "dispatch finished"
        ),
    }
}

pub(crate) fn batch_started(
    switch: &DebugSwitch,
    count: usize,
    mode: ConcurrencyMode,
    total_timeout: Option<Duration>,
) {
    if !switch.is_enabled() {
        return;
    }
    let deadline = total_timeout.map_or_else(|| "none".to_string(), |d| format!("{d:?}"));
    tracing::info!(
        target: DIAG_TARGET,
        count,
        mode = %mode,
        total_timeout = %deadline,
        "batch started"
    );
}

pub(crate) fn member_finished(switch: &DebugSwitch, index: usize, envelope: &ResultEnvelope) {
    if !switch.is_enabled() {
        return;
    }
    tracing::info!(
        target: DIAG_TARGET,
        index,
        tag = envelope.tag().unwrap_or(""),
        outcome = %outcome_label(envelope),
        "batch member finished"
    );
}

pub(crate) fn batch_finished(
    switch: &DebugSwitch,
    mode: ConcurrencyMode,
    elapsed: Duration,
    failed: &[usize],
) {
    if !switch.is_enabled() {
        return;
    }
    tracing::info!(
        target: DIAG_TARGET,
        mode = %mode,
        elapsed_ms = elapsed.as_millis() as u64,
        failed = failed.len(),
        "batch finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use volley_types::{ErrorKind, ExceptionInfo, Meta, ResponseBody};

    fn meta() -> Meta {
        Meta {
            tag: Some("t".to_string()),
            method: Method::Get,
            url: "https://example.test/".to_string(),
            request_time: "2026-01-01T00:00:00Z".to_string(),
            process_time: Duration::ZERO,
        }
    }

    #[test]
    fn switch_is_shared_and_idempotent() {
        let switch = DebugSwitch::new(false);
        let clone = switch.clone();
        switch.set(true);
        switch.set(true);
        assert!(clone.is_enabled());
        clone.set(false);
        assert!(!switch.is_enabled());
    }

    #[test]
    fn outcome_label_prefers_status_then_exception() {
        let ok = ResultEnvelope::response(
            503,
            BTreeMap::new(),
            ResponseBody::Text(String::new()),
            meta(),
        );
        assert_eq!(outcome_label(&ok), "503");

        let failed = ResultEnvelope::failure(
            ExceptionInfo::new(ErrorKind::Cancelled, "request cancelled"),
            meta(),
        );
        assert_eq!(outcome_label(&failed), "Cancelled");
    }
}
