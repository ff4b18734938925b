//! Cleanup phase.
//!
//! Each action is attempted regardless of the others; failures are collected
//! and reported together.

use super::report::CleanupEntry;
use crate::action::acquisition::{AgitatorArgs, GuidingArgs, SetAgitator, SetGuiding};
use crate::action::calibration::{
    CalSourceArgs, LampPowerArgs, NdFilterArgs, SelectCalSource, SetLampPower, SetNdFilters,
};
use crate::action::detector::{AbortExposure, ExpMeterArgs, SetExpMeter};
use crate::action::shutters::{ConfigureShutters, ShutterRouting};
use crate::action::{execute, Action, ActionContext, NoArgs};
use crate::bus::{points, BusValue};
use crate::error::{SequencerError, SequencerResult};
use crate::ob::{CalSource, ExecutionPlan, ExpMeterMode, GuideMode, NdFilter};
use std::future::Future;
use tracing::{debug, error, info};

#[derive(Default)]
struct Cleanup {
    entries: Vec<CleanupEntry>,
    errors: Vec<SequencerError>,
}

impl Cleanup {
    async fn attempt<F>(&mut self, action: impl Into<String>, fut: F)
    where
        F: Future<Output = SequencerResult<()>>,
    {
        let action = action.into();
        match fut.await {
            Ok(()) => {
                debug!(%action, "Cleanup action done");
                self.entries.push(CleanupEntry {
                    action,
                    error: None,
                });
            }
            Err(e) => {
                error!(%action, error = %e, "Cleanup action failed");
                self.entries.push(CleanupEntry {
                    action,
                    error: Some(e.to_string()),
                });
                self.errors.push(e);
            }
        }
    }
}

async fn abort_if_exposing(ctx: &ActionContext) -> SequencerResult<()> {
    let status = ctx.bus().read(points::EXPOSE_STATUS).await?;
    let exposing = ["InProgress", "Readout"]
        .iter()
        .any(|s| status.matches(&BusValue::from(*s)));
    if exposing {
        execute(&AbortExposure, ctx, &NoArgs {}).await?;
    }
    Ok(())
}

async fn lamp_off(ctx: &ActionContext, source: CalSource) -> SequencerResult<()> {
    if !ctx
        .read_flag(&points::readback(&points::lamp_power(source)))
        .await?
    {
        return Ok(());
    }
    execute(&SetLampPower, ctx, &LampPowerArgs { source, on: false }).await
}

/// Return the instrument to a safe idle configuration.
pub(crate) async fn run_cleanup(
    ctx: &ActionContext,
    plan: &ExecutionPlan,
) -> (Vec<CleanupEntry>, Vec<SequencerError>) {
    info!("Cleaning up");
    let mut cleanup = Cleanup::default();

    cleanup
        .attempt("abort_exposure", abort_if_exposing(ctx))
        .await;

    if plan.leave_source_on {
        info!("Leaving calibration sources on");
    } else {
        for source in plan.lamps() {
            cleanup
                .attempt(format!("lamp_off:{source}"), lamp_off(ctx, source))
                .await;
        }
    }

    cleanup
        .attempt(
            SelectCalSource::NAME,
            execute(
                &SelectCalSource,
                ctx,
                &CalSourceArgs {
                    source: CalSource::Home,
                },
            ),
        )
        .await;
    cleanup
        .attempt(
            ConfigureShutters::NAME,
            execute(&ConfigureShutters, ctx, &ShutterRouting::closed()),
        )
        .await;
    cleanup
        .attempt(
            SetNdFilters::NAME,
            execute(
                &SetNdFilters,
                ctx,
                &NdFilterArgs {
                    nd1: NdFilter::Open,
                    nd2: NdFilter::Open,
                },
            ),
        )
        .await;

    if plan.acquisition.is_some() {
        cleanup
            .attempt(
                SetExpMeter::NAME,
                execute(
                    &SetExpMeter,
                    ctx,
                    &ExpMeterArgs {
                        mode: ExpMeterMode::Off,
                        time: None,
                    },
                ),
            )
            .await;
        cleanup
            .attempt(
                SetGuiding::NAME,
                execute(&SetGuiding, ctx, &GuidingArgs { mode: GuideMode::Off }),
            )
            .await;
        cleanup
            .attempt(
                SetAgitator::NAME,
                execute(&SetAgitator, ctx, &AgitatorArgs { enabled: false }),
            )
            .await;
    }

    (cleanup.entries, cleanup.errors)
}
