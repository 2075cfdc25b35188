//! Cancellable polling helper
//!
//! Every readiness wait in kbb8 goes through [`wait_until`]: it polls a check
//! at a fixed cadence and gives up when the shared cancellation token fires
//! or the optional deadline passes.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

/// Poll `check` until it returns `Ok(true)`
///
/// # Arguments
/// * `cancel` - Aborts the wait with a readiness timeout error
/// * `interval` - Time between checks
/// * `timeout` - Optional upper bound for the whole wait
/// * `description` - What is being waited for, used in error messages
/// * `check` - Returns `Ok(true)` when done, `Ok(false)` to keep waiting.
///   An `Err` aborts the wait and is returned as is; callers that want to
///   tolerate transient failures map them to `Ok(false)` themselves.
pub async fn wait_until<F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Option<Duration>,
    description: &str,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();

    loop {
        if check().await? {
            return Ok(());
        }
        trace!(description, "condition not yet met");

        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return Err(Error::readiness_timeout(format!(
                    "timed out after {:?} waiting for {}",
                    timeout, description
                )));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::readiness_timeout(format!(
                    "cancelled while waiting for {}",
                    description
                )));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
