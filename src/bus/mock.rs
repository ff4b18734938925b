//! Mock device bus for testing
//!
//! This bus provides an in-memory implementation of [`DeviceBus`] for exercising
//! the sequencer without an instrument. It provides:
//! - Call logging for test verification
//! - Delayed value updates driven by `tokio::time` (works with paused time)
//! - Optional readback mirroring (`X` -> `X.rb`)
//! - Write hooks for instrument-like behaviour (see [`super::sim`])
//! - Controllable failure injection: jammed points and failing writes

use super::{points, BusValue, DeviceBus, DEFAULT_POLL_INTERVAL};
use crate::error::{SequencerError, SequencerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Hook run (under the bus lock) after a write to its point has been applied.
pub type WriteHook = Arc<dyn Fn(&BusValue, &mut MockState) + Send + Sync>;

/// One recorded bus operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BusCall {
    Read(String),
    Write {
        point: String,
        value: BusValue,
        wait: bool,
    },
}

#[derive(Debug, Clone)]
struct Scheduled {
    at: Instant,
    point: String,
    value: BusValue,
}

/// Control point values plus pending delayed updates.
#[derive(Debug, Default)]
pub struct MockState {
    values: HashMap<String, BusValue>,
    scheduled: Vec<Scheduled>,
    jammed: HashSet<String>,
}

impl MockState {
    pub fn get(&self, point: &str) -> Option<&BusValue> {
        self.values.get(point)
    }

    /// Set a point immediately. Jammed points keep their value.
    pub fn set(&mut self, point: &str, value: impl Into<BusValue>) {
        if self.jammed.contains(point) {
            return;
        }
        self.values.insert(point.to_string(), value.into());
    }

    /// Set a point once `delay` has elapsed.
    pub fn schedule(&mut self, delay: Duration, point: &str, value: impl Into<BusValue>) {
        self.scheduled.push(Scheduled {
            at: Instant::now() + delay,
            point: point.to_string(),
            value: value.into(),
        });
    }

    /// Drop pending updates for `point`.
    pub fn cancel_scheduled(&mut self, point: &str) {
        self.scheduled.retain(|s| s.point != point);
    }

    fn apply_due(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) =
            self.scheduled.drain(..).partition(|s| s.at <= now);
        self.scheduled = pending;

        let mut due = due;
        due.sort_by_key(|s| s.at);
        for update in due {
            self.set(&update.point, update.value);
        }
    }
}

#[derive(Default)]
struct MockInner {
    state: MockState,
    log: Vec<BusCall>,
    hooks: HashMap<String, Vec<WriteHook>>,
    failing_writes: HashSet<String>,
    mirror_delay: Option<Duration>,
}

/// In-memory device bus.
///
/// Cloning shares the underlying state, so a test can keep a handle while the
/// orchestrator owns another.
///
/// # Example
///
/// ```
/// use ob_sequencer::bus::{BusValue, DeviceBus, MockBus};
///
/// # tokio_test::block_on(async {
/// let bus = MockBus::new();
/// bus.write("calbench.nd1", BusValue::from("0.1"), false).await.unwrap();
/// assert_eq!(bus.read("calbench.nd1").await.unwrap(), BusValue::from("0.1"));
/// assert_eq!(bus.writes_to("calbench.nd1"), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<Mutex<MockInner>>,
    poll_interval: Duration,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    /// Create an empty bus. Reading a point that was never set is an error.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner::default())),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Mirror every command write onto its readback point after `delay`.
    pub fn with_mirror(self, delay: Duration) -> Self {
        self.inner.lock().mirror_delay = Some(delay);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set a point without logging a call.
    pub fn set(&self, point: &str, value: impl Into<BusValue>) {
        self.inner.lock().state.set(point, value);
    }

    /// Current value of a point without logging a call.
    pub fn get(&self, point: &str) -> Option<BusValue> {
        let mut inner = self.inner.lock();
        inner.state.apply_due();
        inner.state.get(point).cloned()
    }

    /// Run `hook` after every write to `point`.
    pub fn on_write<F>(&self, point: &str, hook: F)
    where
        F: Fn(&BusValue, &mut MockState) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .hooks
            .entry(point.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Freeze `point` at its current value; it never reaches a new destination.
    pub fn jam(&self, point: &str) {
        self.inner.lock().state.jammed.insert(point.to_string());
    }

    /// Make every write to `point` fail with a bus error.
    pub fn fail_writes_to(&self, point: &str) {
        self.inner.lock().failing_writes.insert(point.to_string());
    }

    /// Get the call log
    pub fn calls(&self) -> Vec<BusCall> {
        self.inner.lock().log.clone()
    }

    /// All writes in order as `(point, value)`.
    pub fn writes(&self) -> Vec<(String, BusValue)> {
        self.inner
            .lock()
            .log
            .iter()
            .filter_map(|call| match call {
                BusCall::Write { point, value, .. } => Some((point.clone(), value.clone())),
                BusCall::Read(_) => None,
            })
            .collect()
    }

    /// Number of writes issued to `point`.
    pub fn writes_to(&self, point: &str) -> usize {
        self.writes().iter().filter(|(p, _)| p == point).count()
    }

    /// Writes issued to anything other than the execution lock points.
    pub fn device_writes(&self) -> Vec<(String, BusValue)> {
        self.writes()
            .into_iter()
            .filter(|(p, _)| !p.starts_with("script."))
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }
}

#[async_trait]
impl DeviceBus for MockBus {
    async fn read(&self, point: &str) -> SequencerResult<BusValue> {
        let mut inner = self.inner.lock();
        inner.state.apply_due();
        inner.log.push(BusCall::Read(point.to_string()));
        inner
            .state
            .get(point)
            .cloned()
            .ok_or_else(|| SequencerError::bus(point, "unknown control point"))
    }

    async fn write(&self, point: &str, value: BusValue, wait: bool) -> SequencerResult<()> {
        let settle = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.state.apply_due();
            inner.log.push(BusCall::Write {
                point: point.to_string(),
                value: value.clone(),
                wait,
            });

            if inner.failing_writes.contains(point) {
                return Err(SequencerError::bus(point, "write rejected"));
            }

            inner.state.set(point, value.clone());
            if let Some(delay) = inner.mirror_delay {
                if !points::is_readback(point) {
                    let rb = points::readback(point);
                    inner.state.cancel_scheduled(&rb);
                    inner.state.schedule(delay, &rb, value.clone());
                }
            }
            if let Some(hooks) = inner.hooks.get(point) {
                for hook in hooks {
                    hook(&value, &mut inner.state);
                }
            }
            inner.mirror_delay.unwrap_or_default()
        };

        if wait && !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
