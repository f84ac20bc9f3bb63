use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::constants::{GATEWAY_TIMEOUT, RETRY_BASE_DELAY};
use crate::error::GatewayError;

/// Run a gateway call with a bounded timeout and exponential backoff.
///
/// `retryable` decides per error whether another attempt is safe; placements
/// pass a stricter predicate than cancels and queries because a timed-out
/// placement may already have landed.
pub async fn with_backoff<T, Fut, Op>(
    label: &str,
    attempts: u32,
    retryable: fn(&GatewayError) -> bool,
    mut op: Op,
) -> Result<T, GatewayError>
where
    Fut: Future<Output = Result<T, GatewayError>>,
    Op: FnMut() -> Fut,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(GATEWAY_TIMEOUT, op()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Network(format!(
                "{label} timed out after {GATEWAY_TIMEOUT:?}"
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if retryable(&error) && attempt < attempts => {
                warn!(
                    call = label,
                    attempt,
                    attempts,
                    error = %error,
                    "Gateway call failed, retrying after {delay:?}"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(Duration::from_secs(30));
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result = with_backoff("test", 5, GatewayError::is_retryable, move || {
            let calls = calls_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::RateLimited)
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result: Result<(), _> =
            with_backoff("test", 3, GatewayError::is_retryable, move || {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Network("down".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_never_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result: Result<(), _> =
            with_backoff("test", 5, GatewayError::is_retryable, move || {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Rejected("insufficient funds".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_predicate_stops_on_network_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let result: Result<(), _> =
            with_backoff("place", 5, GatewayError::is_retryable_for_place, move || {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Network("reset".to_string()))
                }
            })
            .await;

        // The outcome is unknown; reconciliation resolves it, not a retry.
        assert!(matches!(result, Err(GatewayError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
