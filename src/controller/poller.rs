//! Predicate-driven polling.
//!
//! Drives a predicate on a schedule until it succeeds, the reconcile is
//! cancelled, or the timeout elapses. Cancellation is success, matching the
//! pipeline-wide rule; only an exhausted deadline is an error.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::controller::context::ReconcileCx;
use crate::controller::error::{Error, Result};

/// Polling schedule.
#[derive(Clone, Copy, Debug)]
pub struct PollerOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Poll `predicate` until it returns true.
///
/// `subject` names what is being awaited, for logs and the timeout error.
pub async fn poll<F, Fut>(
    cx: &ReconcileCx,
    subject: &str,
    options: &PollerOptions,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + options.timeout;
    loop {
        if cx.cancelled() {
            debug!(subject = %subject, "poll cancelled");
            return Ok(());
        }
        if predicate().await {
            return Ok(());
        }
        if tokio::time::Instant::now() + options.interval > deadline {
            return Err(Error::PollTimeout(subject.to_string()));
        }
        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            _ = cx.token().cancelled() => {
                debug!(subject = %subject, "poll cancelled while sleeping");
                return Ok(());
            }
        }
    }
}
