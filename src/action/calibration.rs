//! Calibration bench actions: source selector, lamps, ND filters and the
//! flat-field fiber aperture.

use super::{Action, ActionContext, ActionKind};
use crate::bus::{points, BusValue};
use crate::error::{SequencerError, SequencerResult};
use crate::ob::{CalSource, FfFiber, NdFilter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Fails with a validation error if `source` is administratively disabled.
pub async fn ensure_source_enabled(ctx: &ActionContext, source: CalSource) -> SequencerResult<()> {
    if is_source_enabled(ctx, source).await? {
        Ok(())
    } else {
        Err(SequencerError::validation(format!(
            "calibration source {source} is disabled"
        )))
    }
}

/// Whether a calibration source may be used. Parking positions are always enabled.
pub async fn is_source_enabled(ctx: &ActionContext, source: CalSource) -> SequencerResult<bool> {
    if !source.emits_light() {
        return Ok(true);
    }
    ctx.read_flag(&points::lamp_enabled(source)).await
}

fn ensure_lamp(source: CalSource) -> SequencerResult<()> {
    if source.is_lamp() {
        Ok(())
    } else {
        Err(SequencerError::validation(format!("{source} has no lamp")))
    }
}

// =============================================================================
// Source selector
// =============================================================================

/// Arguments of [`SelectCalSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalSourceArgs {
    pub source: CalSource,
}

/// Move the calibration source selector.
pub struct SelectCalSource;

#[async_trait]
impl Action for SelectCalSource {
    type Args = CalSourceArgs;
    const NAME: &'static str = "select_cal_source";
    const KIND: ActionKind = ActionKind::CalSource;

    async fn precondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ensure_source_enabled(ctx, args.source).await
    }

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        info!(source = %args.source, "Selecting calibration source");
        ctx.bus()
            .write(points::CAL_SOURCE, args.source.as_str().into(), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(points::CAL_SOURCE),
            &args.source.as_str().into(),
            Self::KIND,
        )
        .await
    }
}

// =============================================================================
// Lamps
// =============================================================================

/// Arguments of [`SetLampPower`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LampPowerArgs {
    pub source: CalSource,
    /// Desired power state.
    pub on: bool,
}

/// Switch a calibration lamp on or off.
///
/// Switching a disabled lamp off is allowed so cleanup can always run.
pub struct SetLampPower;

#[async_trait]
impl Action for SetLampPower {
    type Args = LampPowerArgs;
    const NAME: &'static str = "set_lamp_power";
    const KIND: ActionKind = ActionKind::Lamp;

    async fn precondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ensure_lamp(args.source)?;
        if args.on {
            ensure_source_enabled(ctx, args.source).await?;
        }
        Ok(())
    }

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        debug!(source = %args.source, on = args.on, "Setting lamp power");
        ctx.bus()
            .write(&points::lamp_power(args.source), args.on.into(), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(&points::lamp_power(args.source)),
            &args.on.into(),
            Self::KIND,
        )
        .await
    }
}

/// Arguments of [`WaitForLampWarm`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LampWarmArgs {
    pub source: CalSource,
}

/// Wait for a powered lamp to report `Warm`.
///
/// A warm-up that exceeds its timeout is a destination timeout like any other.
pub struct WaitForLampWarm;

#[async_trait]
impl Action for WaitForLampWarm {
    type Args = LampWarmArgs;
    const NAME: &'static str = "wait_for_lamp_warm";
    const KIND: ActionKind = ActionKind::LampWarmup;

    async fn precondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ensure_lamp(args.source)?;
        if !ctx
            .read_flag(&points::readback(&points::lamp_power(args.source)))
            .await?
        {
            return Err(SequencerError::validation(format!(
                "lamp {} is not powered",
                args.source
            )));
        }
        Ok(())
    }

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        let status = ctx.bus().read(&points::lamp_status(args.source)).await?;
        debug!(source = %args.source, %status, "Waiting for lamp warm-up");
        Ok(())
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::lamp_status(args.source),
            &"Warm".into(),
            Self::KIND,
        )
        .await
    }
}

// =============================================================================
// Filters and fiber aperture
// =============================================================================

/// Arguments of [`SetNdFilters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NdFilterArgs {
    pub nd1: NdFilter,
    pub nd2: NdFilter,
}

/// Move both neutral density filter wheels.
pub struct SetNdFilters;

#[async_trait]
impl Action for SetNdFilters {
    type Args = NdFilterArgs;
    const NAME: &'static str = "set_nd_filters";
    const KIND: ActionKind = ActionKind::NdFilter;

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        debug!(nd1 = %args.nd1, nd2 = %args.nd2, "Moving ND filters");
        ctx.bus()
            .write(points::ND1, args.nd1.as_str().into(), false)
            .await?;
        ctx.bus()
            .write(points::ND2, args.nd2.as_str().into(), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(points::ND1),
            &args.nd1.as_str().into(),
            Self::KIND,
        )
        .await?;
        ctx.confirm(
            &points::readback(points::ND2),
            &args.nd2.as_str().into(),
            Self::KIND,
        )
        .await
    }
}

/// Arguments of [`SetFfFiber`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FfFiberArgs {
    pub ff_fiber: FfFiber,
}

/// Position the flat field fiber.
pub struct SetFfFiber;

#[async_trait]
impl Action for SetFfFiber {
    type Args = FfFiberArgs;
    const NAME: &'static str = "set_ff_fiber";
    const KIND: ActionKind = ActionKind::CalSource;

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.bus()
            .write(points::FF_FIBER, args.ff_fiber.as_str().into(), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        let expected: BusValue = args.ff_fiber.as_str().into();
        ctx.confirm(&points::readback(points::FF_FIBER), &expected, Self::KIND)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::execute;
    use crate::bus::{sim::SimTiming, SimulatedInstrument};
    use std::sync::Arc;

    fn instrument() -> (crate::bus::MockBus, SimulatedInstrument, ActionContext) {
        let (bus, sim) = SimulatedInstrument::new_bus(SimTiming::default());
        let ctx = ActionContext::new(Arc::new(bus.clone()));
        (bus, sim, ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_source_confirms_readback() {
        let (bus, _sim, ctx) = instrument();
        execute(
            &SelectCalSource,
            &ctx,
            &CalSourceArgs {
                source: CalSource::LampA,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            bus.get(&points::readback(points::CAL_SOURCE)),
            Some("LampA".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_source_fails_precondition_without_writes() {
        let (bus, sim, ctx) = instrument();
        sim.disable_source(CalSource::ThAr);
        bus.clear_log();

        let err = execute(
            &SelectCalSource,
            &ctx,
            &CalSourceArgs {
                source: CalSource::ThAr,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SequencerError::Validation(_)));
        assert!(bus.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lamp_power_and_warmup() {
        let (bus, _sim, ctx) = instrument();
        let args = LampPowerArgs {
            source: CalSource::LampA,
            on: true,
        };
        execute(&SetLampPower, &ctx, &args).await.unwrap();
        execute(
            &WaitForLampWarm,
            &ctx,
            &LampWarmArgs {
                source: CalSource::LampA,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            bus.get(&points::lamp_status(CalSource::LampA)),
            Some("Warm".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_requires_power() {
        let (_bus, _sim, ctx) = instrument();
        let err = execute(
            &WaitForLampWarm,
            &ctx,
            &LampWarmArgs {
                source: CalSource::ThAr,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SequencerError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lamp_power_rejects_non_lamp() {
        let (_bus, _sim, ctx) = instrument();
        let args = LampPowerArgs {
            source: CalSource::Etalon,
            on: true,
        };
        assert!(execute(&SetLampPower, &ctx, &args).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_jammed_filter_times_out() {
        let (bus, _sim, ctx) = instrument();
        bus.jam(&points::readback(points::ND1));

        let err = execute(
            &SetNdFilters,
            &ctx,
            &NdFilterArgs {
                nd1: NdFilter::Nd01,
                nd2: NdFilter::Nd01,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.mismatch(), Some(("0.1", "OPEN")));
    }
}
