use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{NotifyError, Notify};

/// Retries a wrapped [`Notify`] with a constant delay between attempts.
/// Cancellation during a retry wait is treated as a graceful abort
/// (`Ok(())`), not a failure of the caller, matching `notifier/retry.go`'s
/// `errors.Is(err, context.Canceled)` short-circuit.
pub struct RetryNotifier<N> {
    next: N,
    max_attempts: usize,
    delay: Duration,
}

impl<N: Notify> RetryNotifier<N> {
    pub fn new(next: N, max_attempts: usize, delay: Duration) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be >= 1");
        Self {
            next,
            max_attempts,
            delay,
        }
    }
}

#[async_trait]
impl<N: Notify> Notify for RetryNotifier<N> {
    async fn notify(&self, cancel: &CancellationToken) -> Result<(), NotifyError> {
        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let err = match self.next.notify(cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            tracing::warn!(
                error = %err,
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                "notify attempt failed, will retry"
            );

            if attempt + 1 == self.max_attempts {
                return Err(NotifyError::Exhausted {
                    attempts: self.max_attempts,
                    source: Box::new(err),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        unreachable!("max_attempts >= 1 guarantees the loop returns on its first iteration")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingFailure(Arc<AtomicUsize>);

    #[async_trait]
    impl Notify for CountingFailure {
        async fn notify(&self, _cancel: &CancellationToken) -> Result<(), NotifyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::UnexpectedStatus(reqwest::StatusCode::BAD_GATEWAY))
        }
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_attempts_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = RetryNotifier::new(CountingFailure(Arc::clone(&calls)), 3, Duration::from_millis(1));

        let err = notifier.notify(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, NotifyError::Exhausted { attempts: 3, .. }));
    }

    struct SucceedsOnNthCall {
        calls: Arc<AtomicUsize>,
        succeed_at: usize,
    }

    #[async_trait]
    impl Notify for SucceedsOnNthCall {
        async fn notify(&self, _cancel: &CancellationToken) -> Result<(), NotifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_at {
                Ok(())
            } else {
                Err(NotifyError::UnexpectedStatus(reqwest::StatusCode::BAD_GATEWAY))
            }
        }
    }

    #[tokio::test]
    async fn succeeds_once_wrapped_notifier_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = RetryNotifier::new(
            SucceedsOnNthCall { calls: Arc::clone(&calls), succeed_at: 2 },
            5,
            Duration::from_millis(1),
        );

        notifier.notify(&CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_during_retry_wait_is_graceful() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = RetryNotifier::new(
            CountingFailure(Arc::clone(&calls)),
            10,
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        // The loop checks cancellation at the top of each iteration, before
        // issuing the wrapped call, so an already-cancelled scope returns
        // success without attempting any request.
        let result = notifier.notify(&cancel).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
