//! Cooperative cancellation.
//!
//! A [`CancelToken`] is handed to every dispatch. Dispatches race their transport future
//! against [`CancelToken::cancelled`]; when the token fires the transport future is
//! dropped, which closes the underlying connection.

use std::future;
use std::sync::Arc;

use tokio::sync::watch;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The batch deadline elapsed.
    Deadline,
    /// A caller asked for cancellation.
    Requested,
}

/// Clonable one-shot cancellation signal. All clones observe the same state; the first
/// cancellation wins and later ones are ignored.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
    rx: watch::Receiver<Option<CancelReason>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancel on behalf of a caller.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Requested);
    }

    /// Returns `true` if this call performed the cancellation.
    pub(crate) fn cancel_with(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so the channel cannot close under us.
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        assert!(token.cancel_with(CancelReason::Deadline));
        assert!(!token.cancel_with(CancelReason::Requested));
        token.cancel();

        assert_eq!(token.reason(), Some(CancelReason::Deadline));
        assert_eq!(token.cancelled().await, CancelReason::Deadline);
    }

    #[tokio::test]
    async fn clones_observe_cancellation() {
        let token = CancelToken::new();
        let observer = token.clone();

        let waiter = tokio::spawn(async move { observer.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();

        let reason = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
        assert_eq!(reason, CancelReason::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn uncancelled_token_stays_pending() {
        let token = CancelToken::new();
        assert!(
            timeout(Duration::from_secs(60), token.cancelled())
                .await
                .is_err()
        );
    }
}
