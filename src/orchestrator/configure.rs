//! Configure phase.
//!
//! Runs only the setup implied by the block's content: the calibration bench
//! when dark or calibration steps (or simultaneous calibration) are present, and
//! target acquisition when science steps are present.

use super::{breakpoint, Interrupt};
use crate::action::acquisition::{AgitatorArgs, GuidingArgs, SetAgitator, SetGuiding, SetTarget};
use crate::action::calibration::{is_source_enabled, LampPowerArgs, SetLampPower};
use crate::action::shutters::{ConfigureShutters, ShutterRouting};
use crate::action::{execute, ActionContext};
use crate::lock::ExecutionLock;
use crate::ob::ExecutionPlan;
use tracing::info;

pub(crate) async fn configure(
    ctx: &ActionContext,
    lock: &ExecutionLock,
    plan: &ExecutionPlan,
    prepower_lamps: bool,
) -> Result<(), Interrupt> {
    let lamps = plan.lamps();

    if plan.uses_calibration_bench() || !lamps.is_empty() {
        info!("Configuring calibration bench");
        breakpoint(lock).await?;
        execute(&ConfigureShutters, ctx, &ShutterRouting::closed()).await?;

        if prepower_lamps {
            for source in lamps {
                if !is_source_enabled(ctx, source).await? {
                    info!(%source, "Lamp disabled; not powering");
                    continue;
                }
                breakpoint(lock).await?;
                execute(&SetLampPower, ctx, &LampPowerArgs { source, on: true }).await?;
            }
        }
    }

    if let Some(acquisition) = &plan.acquisition {
        info!(target = %acquisition.target.name, "Acquiring target");
        breakpoint(lock).await?;
        execute(&SetTarget, ctx, &acquisition.target).await?;
        execute(
            &SetGuiding,
            ctx,
            &GuidingArgs {
                mode: acquisition.guide_mode,
            },
        )
        .await?;
        execute(
            &SetAgitator,
            ctx,
            &AgitatorArgs {
                enabled: acquisition.use_agitator,
            },
        )
        .await?;
    }

    Ok(())
}
