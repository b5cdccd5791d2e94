use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fixed-Delay Retry - retry transient failures until shutdown
// ============================================================================
//
// Hub and subscriber loops never give up on a storage operation. A failure is
// reported, the loop sleeps a fixed delay, and the operation runs again. The
// only way out without success is cancellation.
//
// ============================================================================

/// Sleep for `delay`, returning early when `ct` fires.
///
/// Returns `true` when the full delay elapsed, `false` on cancellation.
pub async fn sleep_or_cancelled(delay: Duration, ct: &CancellationToken) -> bool {
    tokio::select! {
        _ = ct.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run `operation` until it succeeds or `ct` is cancelled.
///
/// `on_failure` sees every failed attempt, numbered from 1. Cancellation is
/// only observed between attempts; an in-flight attempt always completes.
pub async fn retry_until_cancelled<F, Fut, T, E, R>(
    delay: Duration,
    ct: &CancellationToken,
    mut operation: F,
    mut on_failure: R,
) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(u32, &E),
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return Some(result);
            }
            Err(error) => {
                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying after delay"
                );
                on_failure(attempt, &error);

                if !sleep_or_cancelled(delay, ct).await {
                    tracing::debug!(attempt = attempt, "Retry abandoned on shutdown");
                    return None;
                }
            }
        }
    }
}
