//! Batch coordination.
//!
//! Every spec in a batch runs as its own tokio task through the single-request path. The
//! coordinator collects envelopes as tasks finish, enforces the batch deadline, and
//! returns the envelopes in input order.
//!
//! Both modes wait for every member (or the deadline); they differ only in how member
//! failures are classified. SELECT_ALL reports them as [`BatchOutcome::Partial`], JOIN_ALL
//! as [`BatchOutcome::Failed`].

use std::future;
use std::mem;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::StreamExt;
use futures_util::future::{AbortHandle, Abortable, Aborted};
use futures_util::stream::FuturesUnordered;
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::{self, Instant};
use volley_types::{ConcurrencyMode, ErrorKind, ExceptionInfo, RequestSpec, ResultEnvelope};

use crate::cancel::{CancelReason, CancelToken};
use crate::debug::{self, DebugSwitch};
use crate::single::{Dispatcher, cancelled_exception, meta_for, now_rfc3339};
use crate::transport::Transport;

/// How long cancelled dispatches get to observe the token before they are aborted.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Batch-level classification of member outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every member received a response.
    Complete,
    /// SELECT_ALL: some members carry exceptions. Not a failure.
    Partial { failed: Vec<usize> },
    /// JOIN_ALL: at least one member carries an exception.
    Failed { failed: Vec<usize> },
}

impl BatchOutcome {
    fn classify(mode: ConcurrencyMode, envelopes: &[ResultEnvelope]) -> Self {
        let failed: Vec<usize> = envelopes
            .iter()
            .enumerate()
            .filter(|(_, envelope)| !envelope.is_success())
            .map(|(index, _)| index)
            .collect();
        if failed.is_empty() {
            return BatchOutcome::Complete;
        }
        match mode {
            ConcurrencyMode::SelectAll => BatchOutcome::Partial { failed },
            ConcurrencyMode::JoinAll => BatchOutcome::Failed { failed },
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, BatchOutcome::Failed { .. })
    }

    /// Input indices of members that carry exceptions, ascending.
    #[must_use]
    pub fn failed_indices(&self) -> &[usize] {
        match self {
            BatchOutcome::Complete => &[],
            BatchOutcome::Partial { failed } | BatchOutcome::Failed { failed } => failed,
        }
    }
}

/// Result of [`Dispatcher::fetch_requests`]: one envelope per input spec, in input order.
#[derive(Debug, Clone)]
pub struct BatchReport {
    mode: ConcurrencyMode,
    envelopes: Vec<ResultEnvelope>,
    outcome: BatchOutcome,
    elapsed: Duration,
}

impl BatchReport {
    fn new(mode: ConcurrencyMode, envelopes: Vec<ResultEnvelope>, elapsed: Duration) -> Self {
        let outcome = BatchOutcome::classify(mode, &envelopes);
        Self {
            mode,
            envelopes,
            outcome,
            elapsed,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    #[must_use]
    pub fn envelopes(&self) -> &[ResultEnvelope] {
        &self.envelopes
    }

    #[must_use]
    pub fn outcome(&self) -> &BatchOutcome {
        &self.outcome
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }

    #[must_use]
    pub fn into_envelopes(self) -> Vec<ResultEnvelope> {
        self.envelopes
    }

    /// Elevate a failed JOIN_ALL batch to an error. SELECT_ALL batches are always `Ok`.
    pub fn into_result(self) -> Result<Vec<ResultEnvelope>, BatchError> {
        match self.outcome {
            BatchOutcome::Failed { failed } => Err(BatchError {
                mode: self.mode,
                failed,
                envelopes: self.envelopes,
            }),
            BatchOutcome::Complete | BatchOutcome::Partial { .. } => Ok(self.envelopes),
        }
    }
}

/// A JOIN_ALL batch in which at least one member failed. Carries every envelope.
#[derive(Debug, Clone, Error)]
#[error("{mode} batch failed: {} of {} requests did not complete", .failed.len(), .envelopes.len())]
pub struct BatchError {
    pub mode: ConcurrencyMode,
    pub failed: Vec<usize>,
    pub envelopes: Vec<ResultEnvelope>,
}

/// Aborts every registered task when dropped, so a dropped batch future leaves nothing
/// running.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

type Joined = Result<Result<ResultEnvelope, Aborted>, JoinError>;

impl<T: Transport> Dispatcher<T> {
    /// Dispatch every spec concurrently.
    ///
    /// `total_timeout` bounds the whole batch from the moment this is called; members still
    /// outstanding at the deadline are cancelled and reported as `Timeout`. `None` waits
    /// for every member. A zero deadline sends nothing.
    pub async fn fetch_requests(
        &self,
        specs: &[RequestSpec],
        mode: ConcurrencyMode,
        total_timeout: Option<Duration>,
    ) -> BatchReport {
        self.fetch_requests_with_cancel(specs, mode, total_timeout, &CancelToken::new())
            .await
    }

    /// [`fetch_requests`](Self::fetch_requests) that also stops when `cancel` fires;
    /// outstanding members are then reported as `Cancelled`. A token that has already
    /// fired sends nothing.
    pub async fn fetch_requests_with_cancel(
        &self,
        specs: &[RequestSpec],
        mode: ConcurrencyMode,
        total_timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> BatchReport {
        let started = Instant::now();
        if specs.is_empty() {
            return BatchReport::new(mode, Vec::new(), Duration::ZERO);
        }

        let switch = self.debug_switch();
        debug::batch_started(switch, specs.len(), mode, total_timeout);

        let expired = total_timeout
            .is_some_and(|limit| limit.is_zero())
            .then_some(CancelReason::Deadline);
        let envelopes = if let Some(reason) = cancel.reason().or(expired) {
            // Nothing is spawned, so no member can reach the transport.
            let request_time = now_rfc3339();
            specs
                .iter()
                .enumerate()
                .map(|(index, spec)| {
                    let envelope = ResultEnvelope::failure(
                        cancelled_exception(reason),
                        meta_for(spec, request_time.clone(), Duration::ZERO),
                    );
                    debug::member_finished(switch, index, &envelope);
                    envelope
                })
                .collect()
        } else {
            let deadline = total_timeout.and_then(|limit| started.checked_add(limit));
            self.run_batch(specs, deadline, cancel).await
        };

        let report = BatchReport::new(mode, envelopes, started.elapsed());
        debug::batch_finished(switch, mode, report.elapsed(), report.outcome().failed_indices());
        report
    }

    async fn run_batch(
        &self,
        specs: &[RequestSpec],
        deadline: Option<Instant>,
        external: &CancelToken,
    ) -> Vec<ResultEnvelope> {
        let batch_cancel = CancelToken::new();
        let mut collector = Collector::new(specs, self.debug_switch());

        let mut guard = AbortOnDrop(Vec::with_capacity(specs.len()));
        let mut pending = FuturesUnordered::new();
        for (index, spec) in specs.iter().enumerate() {
            let dispatcher = self.clone();
            let spec = spec.clone();
            let cancel = batch_cancel.clone();
            let (abort_handle, abort_registration) = AbortHandle::new_pair();
            let task = Abortable::new(
                async move { dispatcher.dispatch(&spec, &cancel).await },
                abort_registration,
            );
            guard.0.push(abort_handle);
            pending.push(tokio::spawn(task).map(move |joined| (index, joined)));
        }

        let deadline_reached = async {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_reached);

        let mut stopped_by = None;
        while !pending.is_empty() {
            tokio::select! {
                biased;
                Some((index, joined)) = pending.next() => collector.settle(index, joined),
                reason = external.cancelled() => {
                    stopped_by = Some(reason);
                    break;
                }
                () = &mut deadline_reached => {
                    stopped_by = Some(CancelReason::Deadline);
                    break;
                }
            }
        }

        let Some(reason) = stopped_by else {
            return collector.finish(CancelReason::Requested);
        };

        tracing::debug!(
            outstanding = pending.len(),
            ?reason,
            "cancelling outstanding batch members"
        );
        batch_cancel.cancel_with(reason);
        let drain = async {
            while let Some((index, joined)) = pending.next().await {
                collector.settle(index, joined);
            }
        };
        if time::timeout(CANCEL_GRACE, drain).await.is_err() {
            tracing::warn!("batch members did not stop within the grace period; aborting");
        }
        drop(guard);

        collector.finish(reason)
    }
}

/// Places envelopes into input-order slots as members finish.
struct Collector<'a> {
    specs: &'a [RequestSpec],
    slots: Vec<Option<ResultEnvelope>>,
    switch: &'a DebugSwitch,
    request_time: String,
    started: Instant,
}

impl<'a> Collector<'a> {
    fn new(specs: &'a [RequestSpec], switch: &'a DebugSwitch) -> Self {
        Self {
            specs,
            slots: vec![None; specs.len()],
            switch,
            request_time: now_rfc3339(),
            started: Instant::now(),
        }
    }

    fn settle(&mut self, index: usize, joined: Joined) {
        let envelope = match joined {
            Ok(Ok(envelope)) => envelope,
            // Left empty; `finish` fills it with the cancellation envelope.
            Ok(Err(Aborted)) => return,
            Err(err) => {
                tracing::warn!(index, error = %err, "batch member task failed");
                let exception = if err.is_panic() {
                    ExceptionInfo::new(ErrorKind::Internal, "dispatch task panicked")
                } else {
                    ExceptionInfo::new(ErrorKind::Cancelled, "dispatch task cancelled")
                };
                self.synthesize(index, exception)
            }
        };
        debug::member_finished(self.switch, index, &envelope);
        self.slots[index] = Some(envelope);
    }

    fn synthesize(&self, index: usize, exception: ExceptionInfo) -> ResultEnvelope {
        ResultEnvelope::failure(
            exception,
            meta_for(
                &self.specs[index],
                self.request_time.clone(),
                self.started.elapsed(),
            ),
        )
    }

    /// Envelopes in input order; members that never reported get `reason`'s envelope.
    fn finish(mut self, reason: CancelReason) -> Vec<ResultEnvelope> {
        let slots = mem::take(&mut self.slots);
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let envelope = self.synthesize(index, cancelled_exception(reason));
                    debug::member_finished(self.switch, index, &envelope);
                    envelope
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolved::DispatcherConfig;
    use crate::test_support::{StubReply, StubTransport};
    use crate::transport::TransportError;
    use serde_json::json;
    use tokio::task;

    fn dispatcher(transport: StubTransport) -> Dispatcher<StubTransport> {
        Dispatcher::with_transport(transport, DispatcherConfig::default())
    }

    fn spec(path: &str, tag: &str) -> RequestSpec {
        RequestSpec::new(format!("http://stub.test{path}"))
            .unwrap()
            .with_tag(tag)
    }

    fn tags(report: &BatchReport) -> Vec<&str> {
        report
            .envelopes()
            .iter()
            .map(|e| e.tag().unwrap_or_default())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_returns_immediately() {
        let dispatcher = dispatcher(StubTransport::new());
        let report = dispatcher
            .fetch_requests(&[], ConcurrencyMode::JoinAll, Some(Duration::from_secs(1)))
            .await;
        assert!(report.envelopes().is_empty());
        assert_eq!(report.outcome(), &BatchOutcome::Complete);
        assert_eq!(report.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn envelopes_follow_input_order() {
        let dispatcher = dispatcher(
            StubTransport::new()
                .slow("/slow", Duration::from_millis(300))
                .json("/fast", 200, &json!({"fast": true}))
                .text("/boom", 500, "internal error"),
        );
        let specs = [
            spec("/slow", "first"),
            spec("/fast", "second"),
            spec("/boom", "third"),
        ];

        let report = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::SelectAll, Some(Duration::from_secs(5)))
            .await;

        assert_eq!(tags(&report), vec!["first", "second", "third"]);
        let statuses: Vec<_> = report.envelopes().iter().map(ResultEnvelope::http_status).collect();
        assert_eq!(statuses, vec![Some(200), Some(200), Some(500)]);
        assert_eq!(report.outcome(), &BatchOutcome::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_sends_nothing() {
        let dispatcher = dispatcher(StubTransport::new().json("/ok", 200, &json!({})));
        let specs = [spec("/ok", "a"), spec("/ok", "b")];

        let report = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::SelectAll, Some(Duration::ZERO))
            .await;

        assert!(
            report
                .envelopes()
                .iter()
                .all(|e| e.error_kind() == Some(ErrorKind::Timeout))
        );
        assert_eq!(tags(&report), vec!["a", "b"]);
        assert!(dispatcher.transport().requests().is_empty());
        assert_eq!(
            report.outcome(),
            &BatchOutcome::Partial { failed: vec![0, 1] }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn select_all_deadline_cancels_only_stragglers() {
        let dispatcher = dispatcher(
            StubTransport::new()
                .json("/ok", 200, &json!({"ok": true}))
                .slow("/slow", Duration::from_secs(30))
                .fail("/refused", TransportError::Connect("connection refused".into())),
        );
        let specs = [
            spec("/ok", "ok"),
            spec("/slow", "slow"),
            spec("/refused", "refused"),
        ];

        let started = Instant::now();
        let report = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::SelectAll, Some(Duration::from_secs(1)))
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        let envelopes = report.envelopes();
        assert_eq!(envelopes[0].http_status(), Some(200));
        assert_eq!(envelopes[1].error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(
            envelopes[1].exception().unwrap().message,
            "batch deadline exceeded"
        );
        assert_eq!(envelopes[2].error_kind(), Some(ErrorKind::ConnectionError));
        assert_eq!(
            report.outcome(),
            &BatchOutcome::Partial { failed: vec![1, 2] }
        );
        assert!(!report.is_failure());
        assert_eq!(dispatcher.transport().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_beyond_deadline_is_capped() {
        let dispatcher = dispatcher(StubTransport::new().slow("/slow", Duration::from_secs(30)));
        let long = spec("/slow", "long")
            .with_timeout(Duration::from_secs(20))
            .unwrap();

        let started = Instant::now();
        let report = dispatcher
            .fetch_requests(&[long], ConcurrencyMode::SelectAll, Some(Duration::from_millis(500)))
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.envelopes()[0].error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn join_all_success_is_complete() {
        let dispatcher = dispatcher(StubTransport::new().json("/ok", 200, &json!({"ok": true})));
        let specs = [spec("/ok", "a"), spec("/ok", "b"), spec("/ok", "c")];

        let report = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::JoinAll, Some(Duration::from_secs(3)))
            .await;

        assert_eq!(report.outcome(), &BatchOutcome::Complete);
        let envelopes = report.into_result().unwrap();
        assert_eq!(envelopes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn join_all_failure_keeps_every_envelope() {
        let dispatcher = dispatcher(
            StubTransport::new()
                .json("/ok", 200, &json!({"ok": true}))
                .slow("/slow", Duration::from_secs(10)),
        );
        let specs = [spec("/ok", "ok"), spec("/slow", "slow")];

        let report = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::JoinAll, Some(Duration::from_secs(3)))
            .await;

        assert!(report.is_failure());
        let err = report.into_result().unwrap_err();
        assert_eq!(err.mode, ConcurrencyMode::JoinAll);
        assert_eq!(err.failed, vec![1]);
        assert_eq!(err.envelopes[0].http_status(), Some(200));
        assert_eq!(err.envelopes[1].error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(
            err.to_string(),
            "JOIN_ALL batch failed: 1 of 2 requests did not complete"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn join_all_without_deadline_waits_for_every_member() {
        let dispatcher = dispatcher(
            StubTransport::new()
                .text("/boom", 503, "unavailable")
                .slow("/slow", Duration::from_secs(45)),
        );
        let specs = [spec("/boom", "boom"), spec("/slow", "slow")];

        let started = Instant::now();
        let report = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::JoinAll, None)
            .await;

        assert!(started.elapsed() >= Duration::from_secs(45));
        assert_eq!(report.outcome(), &BatchOutcome::Complete);
        assert_eq!(report.envelopes()[0].http_status(), Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancel_marks_outstanding_members() {
        let dispatcher = dispatcher(
            StubTransport::new()
                .json("/ok", 200, &json!({}))
                .slow("/slow", Duration::from_secs(60)),
        );
        let specs = [spec("/ok", "ok"), spec("/slow", "slow")];
        let cancel = CancelToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let report = dispatcher
            .fetch_requests_with_cancel(&specs, ConcurrencyMode::SelectAll, None, &cancel)
            .await;

        assert_eq!(report.envelopes()[0].http_status(), Some(200));
        assert_eq!(
            report.envelopes()[1].error_kind(),
            Some(ErrorKind::Cancelled)
        );
        assert_eq!(dispatcher.transport().in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn already_cancelled_token_sends_nothing() {
        let dispatcher = dispatcher(StubTransport::new().json("/ok", 200, &json!({})));
        let specs = [spec("/ok", "a"), spec("/ok", "b"), spec("/ok", "c")];
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = dispatcher
            .fetch_requests_with_cancel(
                &specs,
                ConcurrencyMode::JoinAll,
                Some(Duration::from_secs(5)),
                &cancel,
            )
            .await;

        assert_eq!(tags(&report), vec!["a", "b", "c"]);
        assert!(
            report
                .envelopes()
                .iter()
                .all(|e| e.error_kind() == Some(ErrorKind::Cancelled))
        );
        assert!(dispatcher.transport().requests().is_empty());
        assert_eq!(
            report.outcome(),
            &BatchOutcome::Failed {
                failed: vec![0, 1, 2]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_member_becomes_internal_envelope() {
        let dispatcher = dispatcher(
            StubTransport::new()
                .json("/ok", 200, &json!({}))
                .route("/panic", Duration::ZERO, StubReply::Panic),
        );
        let specs = [spec("/panic", "panic"), spec("/ok", "ok")];

        let report = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::SelectAll, Some(Duration::from_secs(1)))
            .await;

        assert_eq!(report.envelopes()[0].error_kind(), Some(ErrorKind::Internal));
        assert_eq!(report.envelopes()[0].tag(), Some("panic"));
        assert_eq!(report.envelopes()[1].http_status(), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_batch_future_aborts_members() {
        let dispatcher = dispatcher(StubTransport::new().slow("/slow", Duration::from_secs(60)));
        let specs = [spec("/slow", "a"), spec("/slow", "b")];

        let result = time::timeout(
            Duration::from_millis(100),
            dispatcher.fetch_requests(&specs, ConcurrencyMode::SelectAll, None),
        )
        .await;
        assert!(result.is_err());

        for _ in 0..10 {
            if dispatcher.transport().in_flight() == 0 {
                break;
            }
            task::yield_now().await;
        }
        assert_eq!(dispatcher.transport().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn debug_switch_does_not_change_batch_results() {
        let dispatcher = dispatcher(
            StubTransport::new()
                .json("/ok", 200, &json!({"n": 1}))
                .text("/boom", 500, "x"),
        );
        let specs = [spec("/ok", "a"), spec("/boom", "b")];

        let quiet = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::SelectAll, Some(Duration::from_secs(1)))
            .await;
        dispatcher.set_debug(true);
        let loud = dispatcher
            .fetch_requests(&specs, ConcurrencyMode::SelectAll, Some(Duration::from_secs(1)))
            .await;

        assert_eq!(quiet.outcome(), loud.outcome());
        for (q, l) in quiet.envelopes().iter().zip(loud.envelopes()) {
            assert_eq!(q.http_status(), l.http_status());
            assert_eq!(q.body(), l.body());
            assert_eq!(q.tag(), l.tag());
        }
    }
}
