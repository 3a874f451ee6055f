//! Bounded polling.
//!
//! Every wait in the operator polls at a fixed interval until a check holds
//! or a deadline passes. Expiry is reported as `Error::Timeout`, which leaves
//! the calling phase incomplete so the next reconcile retries it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::controller::error::{Error, Result};

/// Interval and ceiling of bounded waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Poll `check` until it returns `Ok(true)` or the timeout expires.
///
/// A failing check counts as "not yet"; the cluster may be mid-restart.
pub async fn poll_until<F, Fut>(settings: PollSettings, operation: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + settings.timeout;
    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!(operation = %operation, error = %e, "Poll check failed"),
        }

        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                operation: operation.to_string(),
                duration: settings.timeout,
            });
        }
        tokio::time::sleep(settings.interval).await;
    }
}
