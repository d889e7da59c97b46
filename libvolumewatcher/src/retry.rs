//! Bounded retries for plugin RPCs.

use std::future::Future;
use std::time::Duration;

use libcsi::CsiError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-call deadline and exponential backoff for detach RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    ///
    /// Cancellation is checked before every attempt, while a call is in
    /// flight and while sleeping between attempts.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &str,
        mut call: F,
    ) -> Result<T, CsiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CsiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(CsiError::Cancelled);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(CsiError::Cancelled),
                res = tokio::time::timeout(self.call_timeout, call()) => res,
            };
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => CsiError::DeadlineExceeded(format!(
                    "{op} did not complete within {:?}",
                    self.call_timeout
                )),
            };

            if !err.is_retryable() || attempt >= self.attempts {
                return Err(err);
            }

            let delay = self.backoff(attempt);
            warn!(%op, attempt, error = %err, ?delay, "RPC failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(CsiError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
