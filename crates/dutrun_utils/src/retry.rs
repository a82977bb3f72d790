use std::{future::Future, time::Duration};

use tokio::time::Instant;

use crate::cancel::{CancelScope, Cancelled};

/// Retries `operation` up to `max_attempts` times.
///
/// Consecutive attempts start at least `interval` apart: the time an attempt spent running
/// counts against the wait before the next one. Waiting and starting attempts both respect
/// `scope`, whose cancellation reason is returned as the error.
pub async fn async_retry_n<O, R, E, F>(
    max_attempts: usize,
    interval: Duration,
    scope: &CancelScope,
    mut operation: O,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: FnMut(usize) -> F,
    E: From<Cancelled> + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        scope.check()?;

        let started = Instant::now();
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }

                let wait = interval.saturating_sub(started.elapsed());
                tracing::debug!(attempt, max_attempts, ?wait, error = %e, "retrying");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    reason = scope.done() => return Err(reason.into()),
                }
            }
        }
    }
}
