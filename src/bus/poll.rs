//! Bounded polling.
//!
//! Every wait in the sequencer goes through `poll_until`: the device bus
//! `wait_for`, action postconditions and the orchestrator's own waits. A wait
//! can therefore never outlive its timeout by more than one poll interval.

use crate::error::SequencerResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Repeatedly run `check` until it yields `Some`, its error propagates, or
/// `timeout` elapses.
///
/// The check always runs at least once, and once more at the deadline, so a
/// zero timeout degenerates to a single check. Returns `Ok(None)` on timeout.
///
/// # Example
///
/// ```rust,ignore
/// let ready = poll_until(Duration::from_secs(5), Duration::from_millis(100), || async {
///     let status = bus.read("expose.status").await?;
///     Ok((status.as_text() == "Ready").then_some(()))
/// })
/// .await?;
/// ```
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> SequencerResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SequencerResult<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let interval = interval.max(Duration::from_millis(1));

    loop {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep(interval.min(deadline - now)).await;
    }
}
