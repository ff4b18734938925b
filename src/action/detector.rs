//! Detector and exposure actions.
//!
//! An exposure runs `Ready -> InProgress -> Readout -> Ready` on
//! `expose.status`, and `expose.frameno` advances once the readout completes.
//! `Error` on the status point is reported as a detector fault naming the
//! detectors whose own status reads `Error`.

use super::{Action, ActionContext, ActionKind, NoArgs};
use crate::bus::{points, poll_until, BusValue};
use crate::error::{SequencerError, SequencerResult};
use crate::ob::{limits, Detector, ExpMeterMode, TriggeredDetectors};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const READY: &str = "Ready";
const ERROR: &str = "Error";

fn is_status(value: &BusValue, status: &str) -> bool {
    value.matches(&BusValue::from(status))
}

/// Current frame number.
pub async fn current_frame(ctx: &ActionContext) -> SequencerResult<i64> {
    let value = ctx.bus().read(points::FRAME_NUMBER).await?;
    value.as_i64().ok_or_else(|| {
        SequencerError::bus(points::FRAME_NUMBER, format!("not an integer: '{value}'"))
    })
}

/// Detectors whose status reads `Error`.
pub async fn faulted_detectors(ctx: &ActionContext) -> SequencerResult<Vec<Detector>> {
    let mut faulted = Vec::new();
    for detector in Detector::ALL {
        let status = ctx.bus().read(&points::detector_status(detector)).await?;
        if is_status(&status, ERROR) {
            faulted.push(detector);
        }
    }
    Ok(faulted)
}

async fn detector_fault(ctx: &ActionContext) -> SequencerError {
    let detector = match faulted_detectors(ctx).await {
        Ok(faulted) if !faulted.is_empty() => faulted
            .iter()
            .map(|d| d.point_name())
            .collect::<Vec<_>>()
            .join(","),
        _ => "unknown".to_string(),
    };
    SequencerError::DetectorFault { detector }
}

// =============================================================================
// Exposure settings
// =============================================================================

/// Select which detectors take part in the next exposures.
pub struct SetTriggeredDetectors;

#[async_trait]
impl Action for SetTriggeredDetectors {
    type Args = TriggeredDetectors;
    const NAME: &'static str = "set_triggered_detectors";
    const KIND: ActionKind = ActionKind::Detector;

    async fn precondition(&self, _ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        if !args.any() {
            return Err(SequencerError::validation(
                "at least one detector must be triggered",
            ));
        }
        Ok(())
    }

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        for detector in Detector::ALL {
            ctx.bus()
                .write(&points::trigger(detector), args.is_enabled(detector).into(), false)
                .await?;
        }
        Ok(())
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        for detector in Detector::ALL {
            ctx.confirm(
                &points::readback(&points::trigger(detector)),
                &args.is_enabled(detector).into(),
                Self::KIND,
            )
            .await?;
        }
        Ok(())
    }
}

/// Arguments of [`SetExposureTime`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExposureTimeArgs {
    /// Seconds.
    pub exposure_time: f64,
}

/// Set the exposure time of subsequent frames.
pub struct SetExposureTime;

#[async_trait]
impl Action for SetExposureTime {
    type Args = ExposureTimeArgs;
    const NAME: &'static str = "set_exposure_time";
    const KIND: ActionKind = ActionKind::Detector;

    async fn precondition(&self, _ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        limits::validate_exposure_time(Self::NAME, args.exposure_time)
    }

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.bus()
            .write(points::EXPOSURE_TIME, args.exposure_time.into(), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(points::EXPOSURE_TIME),
            &args.exposure_time.into(),
            Self::KIND,
        )
        .await
    }
}

/// Arguments of [`SetObject`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectArgs {
    pub object: String,
}

/// Label written into the headers of subsequent frames.
pub struct SetObject;

#[async_trait]
impl Action for SetObject {
    type Args = ObjectArgs;
    const NAME: &'static str = "set_object";
    const KIND: ActionKind = ActionKind::Detector;

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.bus()
            .write(points::OBJECT, args.object.as_str().into(), true)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(points::OBJECT),
            &args.object.as_str().into(),
            Self::KIND,
        )
        .await
    }
}

/// Arguments of [`SetExpMeter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpMeterArgs {
    pub mode: ExpMeterMode,
    /// Integration time in seconds. Left unchanged when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

/// Configure the exposure meter.
pub struct SetExpMeter;

#[async_trait]
impl Action for SetExpMeter {
    type Args = ExpMeterArgs;
    const NAME: &'static str = "set_exp_meter";
    const KIND: ActionKind = ActionKind::ExpMeter;

    async fn precondition(&self, _ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        match (args.mode, args.time) {
            (ExpMeterMode::Off, _) => Ok(()),
            (_, Some(time)) => limits::validate_expmeter_time(Self::NAME, time),
            (mode, None) => Err(SequencerError::validation(format!(
                "exposure meter mode {} requires a time",
                mode.as_str()
            ))),
        }
    }

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.bus()
            .write(points::EXPMETER_MODE, args.mode.as_str().into(), false)
            .await?;
        if let Some(time) = args.time {
            ctx.bus()
                .write(points::EXPMETER_TIME, time.into(), false)
                .await?;
        }
        Ok(())
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(points::EXPMETER_MODE),
            &args.mode.as_str().into(),
            Self::KIND,
        )
        .await?;
        if let Some(time) = args.time {
            ctx.confirm(
                &points::readback(points::EXPMETER_TIME),
                &time.into(),
                Self::KIND,
            )
            .await?;
        }
        Ok(())
    }
}

// =============================================================================
// Exposure cycle
// =============================================================================

/// Wait until the detectors report `Ready`.
pub struct WaitForReady;

#[async_trait]
impl Action for WaitForReady {
    type Args = NoArgs;
    const NAME: &'static str = "wait_for_ready";
    const KIND: ActionKind = ActionKind::ExposureReady;

    async fn perform(&self, _ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        Ok(())
    }

    async fn postcondition(&self, ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        let timeout = ctx.timeout(Self::KIND);
        let ready = poll_until(timeout, ctx.bus().poll_interval(), || async move {
            let status = ctx.bus().read(points::EXPOSE_STATUS).await?;
            if is_status(&status, ERROR) {
                return Err(detector_fault(ctx).await);
            }
            Ok(is_status(&status, READY).then_some(()))
        })
        .await?;

        match ready {
            Some(()) => Ok(()),
            None => Err(SequencerError::DestinationTimeout {
                point: points::EXPOSE_STATUS.to_string(),
                expected: READY.to_string(),
                actual: ctx.bus().read(points::EXPOSE_STATUS).await?.to_string(),
                timeout,
            }),
        }
    }
}

/// Start an exposure on the triggered detectors.
pub struct StartExposure;

#[async_trait]
impl Action for StartExposure {
    type Args = NoArgs;
    const NAME: &'static str = "start_exposure";
    const KIND: ActionKind = ActionKind::ExposureStart;

    async fn precondition(&self, ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        let status = ctx.bus().read(points::EXPOSE_STATUS).await?;
        if is_status(&status, ERROR) {
            return Err(detector_fault(ctx).await);
        }
        if !is_status(&status, READY) {
            return Err(SequencerError::validation(format!(
                "detectors are not ready to expose (status {status})"
            )));
        }
        Ok(())
    }

    async fn perform(&self, ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        info!("Starting exposure");
        ctx.bus()
            .write(points::EXPOSE_START, BusValue::Bool(true), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        let timeout = ctx.timeout(Self::KIND);
        let started = ctx
            .bus()
            .wait_for(
                points::EXPOSE_STATUS,
                &|v: &BusValue| !is_status(v, READY),
                timeout,
            )
            .await?;
        if started {
            return Ok(());
        }
        Err(SequencerError::DestinationTimeout {
            point: points::EXPOSE_STATUS.to_string(),
            expected: "InProgress".to_string(),
            actual: READY.to_string(),
            timeout,
        })
    }
}

/// Arguments of [`WaitForReadout`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadoutArgs {
    /// Frame number read before the exposure was started.
    pub after_frame: i64,
    /// Seconds, as commanded.
    pub exposure_time: f64,
}

/// Wait for an exposure and its readout to complete.
///
/// Bounded by the exposure time plus the `exposure_readout` timeout.
pub struct WaitForReadout;

impl WaitForReadout {
    /// Bound for a readout wait after an exposure of `exposure_time` seconds.
    pub fn timeout(ctx: &ActionContext, exposure_time: f64) -> Duration {
        Duration::from_secs_f64(exposure_time.max(0.0)) + ctx.timeout(Self::KIND)
    }
}

#[async_trait]
impl Action for WaitForReadout {
    type Args = ReadoutArgs;
    const NAME: &'static str = "wait_for_readout";
    const KIND: ActionKind = ActionKind::ExposureReadout;

    async fn precondition(&self, _ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        limits::validate_exposure_time(Self::NAME, args.exposure_time)
    }

    async fn perform(&self, _ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        debug!(after_frame = args.after_frame, "Waiting for readout");
        Ok(())
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        let timeout = Self::timeout(ctx, args.exposure_time);
        let after_frame = args.after_frame;
        let done = poll_until(timeout, ctx.bus().poll_interval(), || async move {
            let status = ctx.bus().read(points::EXPOSE_STATUS).await?;
            if is_status(&status, ERROR) {
                return Err(detector_fault(ctx).await);
            }
            let frame = current_frame(ctx).await?;
            Ok((frame > after_frame && is_status(&status, READY)).then_some(frame))
        })
        .await?;

        match done {
            Some(frame) => {
                debug!(frame, "Readout complete");
                Ok(())
            }
            None => {
                let status = ctx.bus().read(points::EXPOSE_STATUS).await?;
                let frame = current_frame(ctx).await?;
                Err(SequencerError::DestinationTimeout {
                    point: points::FRAME_NUMBER.to_string(),
                    expected: format!("frame > {after_frame}, status Ready"),
                    actual: format!("frame {frame}, status {status}"),
                    timeout,
                })
            }
        }
    }
}

/// Abort any exposure in progress.
pub struct AbortExposure;

#[async_trait]
impl Action for AbortExposure {
    type Args = NoArgs;
    const NAME: &'static str = "abort_exposure";
    const KIND: ActionKind = ActionKind::ExposureStart;

    async fn perform(&self, ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        warn!("Aborting exposure");
        ctx.bus()
            .write(points::EXPOSE_ABORT, BusValue::Bool(true), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, _args: &Self::Args) -> SequencerResult<()> {
        let timeout = ctx.timeout(Self::KIND);
        let idle = ctx
            .bus()
            .wait_for(
                points::EXPOSE_STATUS,
                &|v: &BusValue| is_status(v, READY) || is_status(v, ERROR),
                timeout,
            )
            .await?;
        if idle {
            return Ok(());
        }
        Err(SequencerError::DestinationTimeout {
            point: points::EXPOSE_STATUS.to_string(),
            expected: READY.to_string(),
            actual: ctx.bus().read(points::EXPOSE_STATUS).await?.to_string(),
            timeout,
        })
    }
}

/// Arguments of [`ResetDetector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResetArgs {
    pub detector: Detector,
}

/// Reset a faulted detector subsystem.
pub struct ResetDetector;

#[async_trait]
impl Action for ResetDetector {
    type Args = ResetArgs;
    const NAME: &'static str = "reset_detector";
    const KIND: ActionKind = ActionKind::DetectorReset;

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        warn!(detector = %args.detector, "Resetting detector");
        ctx.bus()
            .write(&points::detector_reset(args.detector), BusValue::Bool(true), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::detector_status(args.detector),
            &READY.into(),
            Self::KIND,
        )
        .await
    }
}
