//! Stream dial with retry (component I): wraps any stream-creation future
//! with exponential backoff, distinguishing transient failures (worth
//! retrying) from permanent ones (short-circuit immediately).

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{ErrorKind, OverlayError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Whether an error should be retried. Permanent errors (peer not allowed,
/// no such service) short-circuit; everything transport-transient retries.
fn is_permanent(err: &OverlayError) -> bool {
    matches!(err.kind, ErrorKind::Authorization | ErrorKind::NetworkPermanent)
}

/// Retry `dial` up to `max_attempts` times with backoff `1s, 2s, 4s, ...`.
/// The first attempt does not wait. Returns the first success or the last
/// error encountered, with no further retries once a permanent error
/// occurs.
pub async fn dial_with_retry<F, Fut, T>(mut dial: F, max_attempts: u32) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        attempt += 1;
        match dial().await {
            Ok(value) => return Ok(value),
            Err(err) if is_permanent(&err) => {
                debug!(attempt, kind = %err.kind, "dial failed permanently, not retrying");
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                debug!(attempt, max_attempts, "dial exhausted retry budget");
                return Err(err);
            }
            Err(err) => {
                debug!(attempt, backoff = ?backoff, kind = %err.kind, "dial failed transiently, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_immediately_without_any_wait() {
        let calls = AtomicU32::new(0);
        let result = dial_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, OverlayError>(42) }
            },
            5,
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_up_to_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result = dial_with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OverlayError::network_transient("connection reset"))
                    } else {
                        Ok(())
                    }
                }
            },
            5,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_short_circuit_without_retrying() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = dial_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OverlayError::authorization("peer not allowed")) }
            },
            5,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_the_attempt_budget_surfaces_the_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = dial_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OverlayError::network_transient("stream reset")) }
            },
            3,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
