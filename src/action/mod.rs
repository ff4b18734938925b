//! Action contract.
//!
//! Every device-facing operation is a value implementing [`Action`]: three async
//! phases run in order by [`execute`].
//!
//! - `precondition` validates arguments and enablement flags. It fails with a
//!   validation error and never writes to the bus.
//! - `perform` issues the writes, optionally blocking on the bus acknowledgement.
//! - `postcondition` polls for the destination state within the timeout
//!   configured for the action's [`ActionKind`] and raises
//!   [`SequencerError::DestinationTimeout`] if it is not reached.
//!
//! The orchestrator composes actions through this contract only. Actions are
//! also invocable by name with JSON arguments through [`ActionRegistry`].
//!
//! # Example
//!
//! ```rust,ignore
//! let ctx = ActionContext::new(bus);
//! action::execute(&SetNdFilters, &ctx, &NdFilterArgs { nd1: NdFilter::Nd01, nd2: NdFilter::Open }).await?;
//!
//! let registry = ActionRegistry::with_builtin_actions();
//! registry.invoke(&ctx, "set_agitator", json!({"enabled": false})).await?;
//! ```

pub mod acquisition;
pub mod calibration;
pub mod detector;
pub mod registry;
pub mod shutters;

pub use registry::{ActionRegistry, DynAction};

use crate::bus::{BusValue, DeviceBus};
use crate::error::{SequencerError, SequencerResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

// =============================================================================
// Action kinds and timeouts
// =============================================================================

/// Timeout class of an action. Confirmation timeouts are looked up by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CalSource,
    Lamp,
    LampWarmup,
    NdFilter,
    Shutter,
    Detector,
    ExpMeter,
    ExposureReady,
    ExposureStart,
    /// Added to the exposure time to bound a readout wait.
    ExposureReadout,
    DetectorReset,
    Target,
    Guider,
    Agitator,
}

impl ActionKind {
    /// Every kind, in configuration order.
    pub const ALL: [ActionKind; 14] = [
        ActionKind::CalSource,
        ActionKind::Lamp,
        ActionKind::LampWarmup,
        ActionKind::NdFilter,
        ActionKind::Shutter,
        ActionKind::Detector,
        ActionKind::ExpMeter,
        ActionKind::ExposureReady,
        ActionKind::ExposureStart,
        ActionKind::ExposureReadout,
        ActionKind::DetectorReset,
        ActionKind::Target,
        ActionKind::Guider,
        ActionKind::Agitator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::CalSource => "cal_source",
            ActionKind::Lamp => "lamp",
            ActionKind::LampWarmup => "lamp_warmup",
            ActionKind::NdFilter => "nd_filter",
            ActionKind::Shutter => "shutter",
            ActionKind::Detector => "detector",
            ActionKind::ExpMeter => "exp_meter",
            ActionKind::ExposureReady => "exposure_ready",
            ActionKind::ExposureStart => "exposure_start",
            ActionKind::ExposureReadout => "exposure_readout",
            ActionKind::DetectorReset => "detector_reset",
            ActionKind::Target => "target",
            ActionKind::Guider => "guider",
            ActionKind::Agitator => "agitator",
        }
    }

    /// Built-in confirmation timeout.
    pub fn default_timeout(self) -> Duration {
        let secs = match self {
            ActionKind::CalSource => 60,
            ActionKind::Lamp => 10,
            ActionKind::LampWarmup => 600,
            ActionKind::NdFilter => 30,
            ActionKind::Shutter => 5,
            ActionKind::Detector => 10,
            ActionKind::ExpMeter => 10,
            ActionKind::ExposureReady => 60,
            ActionKind::ExposureStart => 10,
            ActionKind::ExposureReadout => 120,
            ActionKind::DetectorReset => 30,
            ActionKind::Target => 30,
            ActionKind::Guider => 30,
            ActionKind::Agitator => 10,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confirmation timeouts keyed by action kind.
///
/// Serialized as a map of humantime strings (`cal_source = "60s"`). Kinds missing
/// from the map use [`ActionKind::default_timeout`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionTimeouts(HashMap<ActionKind, humantime_serde::Serde<Duration>>);

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self(
            ActionKind::ALL
                .into_iter()
                .map(|kind| (kind, kind.default_timeout().into()))
                .collect(),
        )
    }
}

impl ActionTimeouts {
    /// Timeout for `kind`, falling back to its default.
    pub fn get(&self, kind: ActionKind) -> Duration {
        self.0
            .get(&kind)
            .map(|d| **d)
            .unwrap_or_else(|| kind.default_timeout())
    }

    /// Override the timeout for `kind`.
    pub fn set(&mut self, kind: ActionKind, timeout: Duration) {
        self.0.insert(kind, timeout.into());
    }

    /// Explicitly configured timeouts.
    pub fn iter(&self) -> impl Iterator<Item = (ActionKind, Duration)> + '_ {
        self.0.iter().map(|(kind, d)| (*kind, **d))
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything an action needs to talk to the instrument.
#[derive(Clone)]
pub struct ActionContext {
    bus: Arc<dyn DeviceBus>,
    timeouts: ActionTimeouts,
}

impl ActionContext {
    /// Context with default timeouts.
    pub fn new(bus: Arc<dyn DeviceBus>) -> Self {
        Self {
            bus,
            timeouts: ActionTimeouts::default(),
        }
    }

    /// Replace every confirmation timeout.
    pub fn with_timeouts(mut self, timeouts: ActionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The instrument bus.
    pub fn bus(&self) -> &dyn DeviceBus {
        self.bus.as_ref()
    }

    /// Confirmation timeout for `kind`.
    pub fn timeout(&self, kind: ActionKind) -> Duration {
        self.timeouts.get(kind)
    }

    /// All configured timeouts.
    pub fn timeouts(&self) -> &ActionTimeouts {
        &self.timeouts
    }

    /// Wait until `point` loosely matches `expected`, within the timeout for `kind`.
    pub async fn confirm(
        &self,
        point: &str,
        expected: &BusValue,
        kind: ActionKind,
    ) -> SequencerResult<()> {
        self.confirm_within(point, expected, self.timeout(kind)).await
    }

    /// Like [`ActionContext::confirm`] with an explicit bound.
    pub async fn confirm_within(
        &self,
        point: &str,
        expected: &BusValue,
        timeout: Duration,
    ) -> SequencerResult<()> {
        let reached = self
            .bus
            .wait_for(point, &|v: &BusValue| v.matches(expected), timeout)
            .await?;
        if reached {
            return Ok(());
        }

        let actual = self
            .bus
            .read(point)
            .await
            .map(|v| v.to_string())
            .unwrap_or_else(|e| format!("<unreadable: {e}>"));
        Err(SequencerError::DestinationTimeout {
            point: point.to_string(),
            expected: expected.to_string(),
            actual,
            timeout,
        })
    }

    /// Read a boolean flag, treating unreadable values as a bus error.
    pub async fn read_flag(&self, point: &str) -> SequencerResult<bool> {
        let value = self.bus.read(point).await?;
        value
            .as_bool()
            .ok_or_else(|| SequencerError::bus(point, format!("expected a flag, read '{value}'")))
    }
}

// =============================================================================
// Contract
// =============================================================================

/// A device-facing operation with a three-phase contract.
#[async_trait]
pub trait Action: Send + Sync {
    /// Arguments, mirroring the action's input fields.
    type Args: Serialize + DeserializeOwned + fmt::Debug + Send + Sync;

    /// Name used for invocation and logging.
    const NAME: &'static str;

    /// Timeout class used by the postcondition.
    const KIND: ActionKind;

    /// Validate arguments and enablement flags. Must not write to the bus.
    async fn precondition(&self, _ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        Ok(())
    }

    /// Issue the writes.
    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()>;

    /// Confirm the destination state within the configured timeout.
    async fn postcondition(&self, _ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        Ok(())
    }
}

/// Run an action's three phases in order.
#[instrument(skip_all, fields(action = A::NAME))]
pub async fn execute<A: Action>(
    action: &A,
    ctx: &ActionContext,
    args: &A::Args,
) -> SequencerResult<()> {
    debug!(?args, "precondition");
    action.precondition(ctx, args).await?;
    action.perform(ctx, args).await?;
    action.postcondition(ctx, args).await?;
    debug!("confirmed");
    Ok(())
}

/// Arguments of actions that take none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;

    #[test]
    fn test_timeouts_fall_back_to_defaults() {
        let timeouts: ActionTimeouts =
            serde_json::from_value(serde_json::json!({"nd_filter": "45s"})).unwrap();
        assert_eq!(timeouts.get(ActionKind::NdFilter), Duration::from_secs(45));
        assert_eq!(
            timeouts.get(ActionKind::LampWarmup),
            ActionKind::LampWarmup.default_timeout()
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<ActionTimeouts, _> =
            serde_json::from_value(serde_json::json!({"teleporter": "1s"}));
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_reports_actual_value() {
        let bus = MockBus::new();
        bus.set("calbench.nd1.rb", "OPEN");
        let ctx = ActionContext::new(Arc::new(bus));

        let err = ctx
            .confirm_within("calbench.nd1.rb", &"0.1".into(), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            SequencerError::DestinationTimeout {
                expected, actual, ..
            } => {
                assert_eq!(expected, "0.1");
                assert_eq!(actual, "OPEN");
            }
            other => panic!("Expected DestinationTimeout, got {other:?}"),
        }
    }
}
