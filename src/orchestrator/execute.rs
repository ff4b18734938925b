//! Execute phase.
//!
//! Steps run in order: darks, calibrations, science. Before each step the
//! runner computes the device configuration the step needs and issues only the
//! commands whose target differs from what it last applied.
//!
//! Cancellation is checked before a step's first command, after the lamp
//! warm-up and detector ready waits, before every exposure command, and while
//! an exposure is in flight. A cancellation seen
//! mid-exposure lets the exposure finish (or aborts it if it faults) and then
//! stops the run.

use super::report::{RunReport, SkipReason, StepOutcome, StepStatus};
use super::{breakpoint, Interrupt};
use crate::action::calibration::{
    is_source_enabled, CalSourceArgs, FfFiberArgs, LampPowerArgs, LampWarmArgs, NdFilterArgs,
    SelectCalSource, SetFfFiber, SetLampPower, SetNdFilters, WaitForLampWarm,
};
use crate::action::detector::{
    self, AbortExposure, ExpMeterArgs, ExposureTimeArgs, ObjectArgs, ReadoutArgs, ResetArgs,
    ResetDetector, SetExpMeter, SetExposureTime, SetObject, SetTriggeredDetectors, StartExposure,
    WaitForReadout, WaitForReady,
};
use crate::action::shutters::{ConfigureShutters, ShutterRouting};
use crate::action::{execute, Action, ActionContext, NoArgs};
use crate::bus::points;
use crate::error::{SequencerError, SequencerResult};
use crate::lock::{CancellationSignal, ExecutionLock};
use crate::ob::{
    CalSource, ExecutionPlan, ExpMeterMode, FfFiber, NdFilter, PlannedStep, StepSpec,
    TriggeredDetectors,
};
use tracing::{debug, info, instrument, warn};

/// Device state a step needs. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DeviceConfiguration {
    /// Lamp that must be powered and warm.
    pub lamp: Option<CalSource>,
    pub source: Option<CalSource>,
    pub nd: Option<(NdFilter, NdFilter)>,
    pub ff_fiber: Option<FfFiber>,
    pub shutters: Option<ShutterRouting>,
    pub detectors: Option<TriggeredDetectors>,
    pub exposure_time: Option<f64>,
    pub exp_meter: Option<(ExpMeterMode, Option<f64>)>,
    pub object: Option<String>,
}

impl DeviceConfiguration {
    pub fn for_step(spec: &StepSpec, plan: &ExecutionPlan) -> Self {
        let mut config = DeviceConfiguration {
            detectors: Some(spec.triggered_detectors()),
            exposure_time: Some(spec.exposure_time()),
            ..Default::default()
        };

        match spec {
            StepSpec::Dark(step) => {
                config.shutters = Some(ShutterRouting::closed());
                config.object = Some(step.object.clone().unwrap_or_else(|| "Dark".to_string()));
            }
            StepSpec::Calibration(step) => {
                config.lamp = step.source.is_lamp().then_some(step.source);
                config.source = Some(step.source);
                config.nd = Some((step.nd1, step.nd2));
                config.ff_fiber = step.ff_fiber;
                config.shutters = Some(ShutterRouting {
                    cal_sci: step.sci_select,
                    cal_sky: step.sky_select,
                    simul_cal: step.simul_cal,
                    ..ShutterRouting::closed()
                });
                config.object = Some(
                    step.object
                        .clone()
                        .unwrap_or_else(|| step.source.as_str().to_string()),
                );
            }
            StepSpec::Science(resolved) => {
                let step = &resolved.step;
                config.shutters = Some(ShutterRouting {
                    science: true,
                    sky: true,
                    simul_cal: step.simul_cal,
                    ..ShutterRouting::closed()
                });
                if step.simul_cal {
                    config.source = plan.simul_cal_source;
                    config.lamp = plan.simul_cal_source.filter(|s| s.is_lamp());
                    config.nd = resolved.nd;
                }
                config.exp_meter = Some((step.exp_meter_mode, step.exp_meter_time));
                config.object = step.object.clone().or_else(|| {
                    plan.acquisition
                        .as_ref()
                        .map(|a| a.target.name.clone())
                });
            }
        }
        config
    }
}

/// Issue `action` only when `desired` is set and differs from `applied`.
async fn reconcile<A, T>(
    ctx: &ActionContext,
    action: &A,
    applied: &mut Option<T>,
    desired: &Option<T>,
    args: impl FnOnce(&T) -> A::Args,
) -> SequencerResult<()>
where
    A: Action,
    T: PartialEq + Clone,
{
    let Some(target) = desired else {
        return Ok(());
    };
    if applied.as_ref() == Some(target) {
        debug!(action = A::NAME, "Already configured");
        return Ok(());
    }
    let args = args(target);
    execute(action, ctx, &args).await?;
    *applied = Some(target.clone());
    Ok(())
}

pub(crate) struct StepRunner<'a> {
    ctx: &'a ActionContext,
    lock: &'a ExecutionLock,
    detector_recovery: bool,
    applied: DeviceConfiguration,
}

impl<'a> StepRunner<'a> {
    pub fn new(ctx: &'a ActionContext, lock: &'a ExecutionLock, detector_recovery: bool) -> Self {
        Self {
            ctx,
            lock,
            detector_recovery,
            applied: DeviceConfiguration::default(),
        }
    }

    /// Run every step of `plan`, recording outcomes in `report`.
    ///
    /// Stops at the first failure or cancellation; later steps stay
    /// `NotAttempted`.
    pub async fn run(
        &mut self,
        plan: &ExecutionPlan,
        report: &mut RunReport,
    ) -> Result<(), Interrupt> {
        for planned in plan.steps() {
            let step_ref = planned.step_ref;
            let Some(outcome) = report.step_mut(step_ref) else {
                continue;
            };

            match self.run_step(plan, planned, outcome).await {
                Ok(()) => {}
                Err(Interrupt::Cancel(signal)) => {
                    outcome.status = if outcome.exposures_completed == outcome.exposures_planned {
                        StepStatus::Completed
                    } else {
                        StepStatus::Cancelled
                    };
                    return Err(Interrupt::Cancel(signal));
                }
                Err(fault) => {
                    outcome.status = StepStatus::Failed;
                    return Err(fault.at(step_ref));
                }
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(step = %planned.step_ref))]
    async fn run_step(
        &mut self,
        plan: &ExecutionPlan,
        planned: &PlannedStep,
        outcome: &mut StepOutcome,
    ) -> Result<(), Interrupt> {
        if let StepSpec::Calibration(step) = &planned.spec {
            if !is_source_enabled(self.ctx, step.source).await? {
                info!(source = %step.source, "Calibration source disabled; skipping step");
                outcome.status = StepStatus::Skipped(SkipReason::SourceDisabled {
                    source: step.source,
                });
                return Ok(());
            }
        }

        let desired = DeviceConfiguration::for_step(&planned.spec, plan);
        breakpoint(self.lock).await?;
        self.apply(&desired).await?;

        let exposure_time = planned.spec.exposure_time();
        let count = planned.spec.exposure_count();
        info!(count, exposure_time, "Starting exposures");

        for n in 1..=count {
            breakpoint(self.lock).await?;
            let pending = self.expose_with_recovery(exposure_time, outcome).await?;
            outcome.exposures_completed += 1;
            debug!(exposure = n, of = count, "Exposure complete");
            if let Some(signal) = pending {
                return Err(Interrupt::Cancel(signal));
            }
        }

        outcome.status = StepStatus::Completed;
        Ok(())
    }

    async fn apply(&mut self, desired: &DeviceConfiguration) -> Result<(), Interrupt> {
        let ctx = self.ctx;
        let lock = self.lock;
        let applied = &mut self.applied;

        if let Some(lamp) = desired.lamp {
            if applied.lamp != Some(lamp) {
                if !ctx
                    .read_flag(&points::readback(&points::lamp_power(lamp)))
                    .await?
                {
                    execute(&SetLampPower, ctx, &LampPowerArgs { source: lamp, on: true }).await?;
                }
                execute(&WaitForLampWarm, ctx, &LampWarmArgs { source: lamp }).await?;
                applied.lamp = Some(lamp);
                breakpoint(lock).await?;
            }
        }

        reconcile(ctx, &SelectCalSource, &mut applied.source, &desired.source, |s| {
            CalSourceArgs { source: *s }
        })
        .await?;
        reconcile(ctx, &SetNdFilters, &mut applied.nd, &desired.nd, |(nd1, nd2)| {
            NdFilterArgs { nd1: *nd1, nd2: *nd2 }
        })
        .await?;
        reconcile(ctx, &SetFfFiber, &mut applied.ff_fiber, &desired.ff_fiber, |f| {
            FfFiberArgs { ff_fiber: *f }
        })
        .await?;
        reconcile(ctx, &ConfigureShutters, &mut applied.shutters, &desired.shutters, |s| *s)
            .await?;
        reconcile(
            ctx,
            &SetTriggeredDetectors,
            &mut applied.detectors,
            &desired.detectors,
            |d| *d,
        )
        .await?;
        reconcile(
            ctx,
            &SetExposureTime,
            &mut applied.exposure_time,
            &desired.exposure_time,
            |t| ExposureTimeArgs { exposure_time: *t },
        )
        .await?;
        reconcile(
            ctx,
            &SetExpMeter,
            &mut applied.exp_meter,
            &desired.exp_meter,
            |(mode, time)| ExpMeterArgs {
                mode: *mode,
                time: *time,
            },
        )
        .await?;
        reconcile(ctx, &SetObject, &mut applied.object, &desired.object, |o| {
            ObjectArgs { object: o.clone() }
        })
        .await?;
        Ok(())
    }

    /// One exposure, with a single abort/reset/retry on a detector fault.
    async fn expose_with_recovery(
        &mut self,
        exposure_time: f64,
        outcome: &mut StepOutcome,
    ) -> Result<Option<CancellationSignal>, Interrupt> {
        match self.expose(exposure_time).await {
            Err(Interrupt::Fault {
                error: SequencerError::DetectorFault { detector },
                ..
            }) if self.detector_recovery => {
                warn!(%detector, "Detector fault; attempting recovery");
                outcome.recoveries += 1;
                self.recover().await?;
                self.expose(exposure_time).await
            }
            other => other,
        }
    }

    /// Take one exposure. Returns a cancellation observed while it was in
    /// flight.
    async fn expose(&mut self, exposure_time: f64) -> Result<Option<CancellationSignal>, Interrupt> {
        let ctx = self.ctx;
        execute(&WaitForReady, ctx, &NoArgs {}).await?;
        breakpoint(self.lock).await?;
        let after_frame = detector::current_frame(ctx).await?;
        execute(&StartExposure, ctx, &NoArgs {}).await?;

        let mut pending = self.lock.check_cancellation().await?;
        if pending.is_some() {
            info!("Cancellation requested; finishing exposure in flight");
        }

        let readout = execute(
            &WaitForReadout,
            ctx,
            &ReadoutArgs {
                after_frame,
                exposure_time,
            },
        )
        .await;

        if let Err(error) = readout {
            return match pending {
                Some(signal) => {
                    warn!(%error, "Exposure failed after cancellation; aborting");
                    if let Err(abort) = execute(&AbortExposure, ctx, &NoArgs {}).await {
                        warn!(error = %abort, "Abort failed");
                    }
                    Err(Interrupt::Cancel(signal))
                }
                None => Err(error.into()),
            };
        }

        if pending.is_none() {
            pending = self.lock.check_cancellation().await?;
        }
        Ok(pending)
    }

    async fn recover(&mut self) -> SequencerResult<()> {
        let ctx = self.ctx;
        execute(&AbortExposure, ctx, &NoArgs {}).await?;
        for detector in detector::faulted_detectors(ctx).await? {
            execute(&ResetDetector, ctx, &ResetArgs { detector }).await?;
        }
        execute(&WaitForReady, ctx, &NoArgs {}).await
    }
}
