//! Execution lock registry.
//!
//! Instrument-wide advisory mutual exclusion for orchestrated scripts, plus the
//! cooperative cancellation flag. The lock lives on the device bus as the
//! `script.*` control points, so every process talking to the instrument sees
//! the same holder.
//!
//! # Semantics
//!
//! - [`ExecutionLock::acquire`] fails with [`SequencerError::LockHeld`] if a
//!   holder is recorded. There is no liveness detection: a crashed holder has to
//!   be cleared by an operator with [`ExecutionLock::force_clear`].
//! - [`ExecutionLock::request_cancel`] only sets the flag.
//! - [`ExecutionLock::check_cancellation`] clears the flag and returns a
//!   [`CancellationSignal`] when it was set.
//! - Releasing clears the holder identity and the cancellation flag.
//!
//! Acquisition returns a [`LockGuard`]. Callers await [`LockGuard::release`] on
//! every exit path. A guard dropped without being released (a panicking or
//! dropped run) schedules a forced clear on the current runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = ExecutionLock::new(bus.clone());
//! let mut guard = lock.acquire(LockIdentity::current("calibrate", "dark frames")).await?;
//!
//! if let Some(signal) = lock.check_cancellation().await? {
//!     info!(%signal, "stopping");
//! }
//!
//! guard.release().await?;
//! ```

use crate::bus::{points, BusValue, DeviceBus};
use crate::error::{SequencerError, SequencerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Who holds the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockIdentity {
    /// Name the holding script registered under.
    pub script_name: String,
    /// Process id of the holder.
    pub pid: u32,
    /// Host the holder runs on.
    pub host: String,
    /// Advisory message, typically the observing block identity.
    pub message: String,
}

impl LockIdentity {
    /// Identity of the current process.
    pub fn current(script_name: impl Into<String>, message: impl Into<String>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            script_name: script_name.into(),
            pid: std::process::id(),
            host,
            message: message.into(),
        }
    }

    /// Same script, process and host. The message is advisory and ignored.
    pub fn is_same_holder(&self, other: &LockIdentity) -> bool {
        self.script_name == other.script_name && self.pid == other.pid && self.host == other.host
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {} on {})", self.script_name, self.pid, self.host)
    }
}

/// Snapshot of the lock points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    /// `None` when no holder is recorded.
    pub holder: Option<LockIdentity>,
    /// A stop request is pending.
    pub cancel_requested: bool,
}

impl LockStatus {
    /// No holder and no pending stop request.
    pub fn is_free(&self) -> bool {
        self.holder.is_none() && !self.cancel_requested
    }
}

/// Operator-requested stop, observed at a breakpoint.
///
/// This is a value, not an error: the step loop threads it through to the
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationSignal {
    /// When the stop request was consumed.
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancellation requested (observed {})", self.observed_at.to_rfc3339())
    }
}

/// Handle to the instrument-wide execution lock.
#[derive(Clone)]
pub struct ExecutionLock {
    bus: Arc<dyn DeviceBus>,
    /// Serializes check-then-write within this process.
    acquire_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ExecutionLock {
    /// Lock backed by the `script.*` points of `bus`.
    pub fn new(bus: Arc<dyn DeviceBus>) -> Self {
        Self {
            bus,
            acquire_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Read the current holder and stop flag.
    pub async fn status(&self) -> SequencerResult<LockStatus> {
        let name = self.bus.read(points::SCRIPT_NAME).await?;
        let cancel_requested = self.read_stop_flag().await?;

        let holder = if name.is_empty() {
            None
        } else {
            let pid = self
                .bus
                .read(points::SCRIPT_PID)
                .await?
                .as_i64()
                .and_then(|p| u32::try_from(p).ok())
                .unwrap_or(0);
            Some(LockIdentity {
                script_name: name.to_string(),
                pid,
                host: self.bus.read(points::SCRIPT_HOST).await?.to_string(),
                message: self.bus.read(points::SCRIPT_MSG).await?.to_string(),
            })
        };

        Ok(LockStatus {
            holder,
            cancel_requested,
        })
    }

    /// Record `identity` as the holder.
    ///
    /// Also clears a stale cancellation flag so an old request cannot stop the
    /// new run.
    pub async fn acquire(&self, identity: LockIdentity) -> SequencerResult<LockGuard> {
        let _gate = self.acquire_gate.lock().await;

        if let Some(holder) = self.status().await?.holder {
            warn!(%holder, requested_by = %identity, "Execution lock is held");
            return Err(SequencerError::LockHeld {
                holder: holder.to_string(),
            });
        }

        if let Err(e) = self.write_identity(&identity).await {
            error!(error = %e, "Failed to record lock holder; clearing partial state");
            if let Err(clear_err) = self.force_clear().await {
                error!(error = %clear_err, "Failed to clear partial lock state");
            }
            return Err(e);
        }

        info!(holder = %identity, "Execution lock acquired");
        Ok(LockGuard {
            lock: self.clone(),
            identity,
            released: false,
        })
    }

    async fn write_identity(&self, identity: &LockIdentity) -> SequencerResult<()> {
        self.bus
            .write(points::SCRIPT_NAME, identity.script_name.as_str().into(), true)
            .await?;
        self.bus
            .write(points::SCRIPT_PID, identity.pid.into(), false)
            .await?;
        self.bus
            .write(points::SCRIPT_HOST, identity.host.as_str().into(), false)
            .await?;
        self.bus
            .write(points::SCRIPT_MSG, identity.message.as_str().into(), false)
            .await?;
        self.bus
            .write(points::SCRIPT_STOP, BusValue::Bool(false), false)
            .await
    }

    /// Ask the current holder to stop at its next breakpoint.
    pub async fn request_cancel(&self) -> SequencerResult<()> {
        info!("Cancellation requested");
        self.bus
            .write(points::SCRIPT_STOP, BusValue::Bool(true), false)
            .await
    }

    /// Consume a pending cancellation request, if any.
    pub async fn check_cancellation(&self) -> SequencerResult<Option<CancellationSignal>> {
        if !self.read_stop_flag().await? {
            return Ok(None);
        }
        self.bus
            .write(points::SCRIPT_STOP, BusValue::Bool(false), false)
            .await?;
        let signal = CancellationSignal {
            observed_at: Utc::now(),
        };
        info!(%signal, "Cancellation observed");
        Ok(Some(signal))
    }

    /// Clear holder identity and cancellation flag, stopping at the first error.
    pub async fn release(&self) -> SequencerResult<()> {
        self.bus
            .write(points::SCRIPT_NAME, BusValue::empty(), true)
            .await?;
        self.bus
            .write(points::SCRIPT_PID, BusValue::Int(0), false)
            .await?;
        self.bus
            .write(points::SCRIPT_HOST, BusValue::empty(), false)
            .await?;
        self.bus
            .write(points::SCRIPT_MSG, BusValue::empty(), false)
            .await?;
        self.bus
            .write(points::SCRIPT_STOP, BusValue::Bool(false), false)
            .await
    }

    /// Clear every lock point, attempting each write even if an earlier one fails.
    ///
    /// This is the operator action for a crashed holder and the fallback when a
    /// guarded release fails.
    pub async fn force_clear(&self) -> SequencerResult<()> {
        let writes = [
            (points::SCRIPT_NAME, BusValue::empty()),
            (points::SCRIPT_PID, BusValue::Int(0)),
            (points::SCRIPT_HOST, BusValue::empty()),
            (points::SCRIPT_MSG, BusValue::empty()),
            (points::SCRIPT_STOP, BusValue::Bool(false)),
        ];

        let mut first_error = None;
        for (point, value) in writes {
            if let Err(e) = self.bus.write(point, value, false).await {
                warn!(point, error = %e, "Failed to clear lock point");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                warn!("Execution lock force-cleared");
                Ok(())
            }
        }
    }

    /// The recorded holder, if it is someone other than `identity`.
    async fn other_holder(&self, identity: &LockIdentity) -> SequencerResult<Option<LockIdentity>> {
        let holder = self.status().await?.holder;
        Ok(holder.filter(|h| !h.is_same_holder(identity)))
    }

    async fn read_stop_flag(&self) -> SequencerResult<bool> {
        let value = self.bus.read(points::SCRIPT_STOP).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

/// Proof of holding the execution lock.
pub struct LockGuard {
    lock: ExecutionLock,
    identity: LockIdentity,
    released: bool,
}

impl LockGuard {
    /// Identity recorded when the lock was acquired.
    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    /// The lock this guard holds.
    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    /// Whether `release` or `force_release` has completed.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the lock.
    ///
    /// If another holder has been recorded in the meantime (after an operator
    /// force-clear) their record is left untouched. Holders are told apart by
    /// script name, pid and host.
    pub async fn release(&mut self) -> SequencerResult<()> {
        if self.released {
            return Ok(());
        }

        if let Some(holder) = self.lock.other_holder(&self.identity).await? {
            warn!(
                %holder,
                ours = %self.identity,
                "Lock now held by another script; not releasing"
            );
            self.released = true;
            return Ok(());
        }

        self.lock.release().await?;
        self.released = true;
        info!(holder = %self.identity, "Execution lock released");
        Ok(())
    }

    /// Fallback when [`LockGuard::release`] fails.
    pub async fn force_release(&mut self) -> SequencerResult<()> {
        self.lock.force_clear().await?;
        self.released = true;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(holder = %self.identity, "Lock guard dropped without release; clearing");
        match Handle::try_current() {
            Ok(handle) => {
                let lock = self.lock.clone();
                let identity = self.identity.clone();
                handle.spawn(async move {
                    match lock.other_holder(&identity).await {
                        Ok(Some(holder)) => {
                            warn!(%holder, "Lock now held by another script; not clearing");
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Cannot read lock holder; not clearing");
                            return;
                        }
                    }
                    match lock.force_clear().await {
                        Ok(()) => debug!("Dropped lock guard cleared"),
                        Err(e) => error!(error = %e, "Failed to clear lock from dropped guard"),
                    }
                });
            }
            Err(_) => error!("No runtime available to clear a dropped lock guard"),
        }
    }
}
