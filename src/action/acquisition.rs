//! Telescope-side acquisition: target coordinates, guiding and the fiber agitator.

use super::{Action, ActionContext, ActionKind};
use crate::bus::{points, BusValue};
use crate::error::{SequencerError, SequencerResult};
use crate::ob::{GuideMode, Target};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Target fields published on the bus as `target.<field>`.
pub const TARGET_FIELDS: [&str; 12] = [
    "name",
    "gaia_id",
    "two_mass_id",
    "gmag",
    "jmag",
    "ra",
    "dec",
    "epoch",
    "pm_ra",
    "pm_dec",
    "parallax",
    "rv",
];

fn target_values(target: &Target) -> [(&'static str, BusValue); 12] {
    let text = |v: &Option<String>| v.clone().map(BusValue::from).unwrap_or_else(BusValue::empty);
    let number = |v: Option<f64>| v.map(BusValue::from).unwrap_or_else(BusValue::empty);
    [
        ("name", BusValue::from(target.name.as_str())),
        ("gaia_id", text(&target.gaia_id)),
        ("two_mass_id", text(&target.two_mass_id)),
        ("gmag", number(target.gmag)),
        ("jmag", number(target.jmag)),
        ("ra", text(&target.ra)),
        ("dec", text(&target.dec)),
        ("epoch", number(target.epoch)),
        ("pm_ra", number(target.pm_ra)),
        ("pm_dec", number(target.pm_dec)),
        ("parallax", number(target.parallax)),
        ("rv", number(target.rv)),
    ]
}

/// Publish target information. Unset fields are cleared.
pub struct SetTarget;

#[async_trait]
impl Action for SetTarget {
    type Args = Target;
    const NAME: &'static str = "set_target";
    const KIND: ActionKind = ActionKind::Target;

    async fn precondition(&self, _ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        if args.name.trim().is_empty() {
            return Err(SequencerError::validation("target name must not be blank"));
        }
        Ok(())
    }

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        info!(target = %args.name, "Setting target");
        for (field, value) in target_values(args) {
            ctx.bus().write(&points::target(field), value, true).await?;
        }
        Ok(())
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(&points::target("name")),
            &args.name.as_str().into(),
            Self::KIND,
        )
        .await
    }
}

/// Arguments of [`SetGuiding`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuidingArgs {
    pub mode: GuideMode,
}

/// Switch the guider mode.
pub struct SetGuiding;

#[async_trait]
impl Action for SetGuiding {
    type Args = GuidingArgs;
    const NAME: &'static str = "set_guiding";
    const KIND: ActionKind = ActionKind::Guider;

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.bus()
            .write(points::GUIDER_MODE, args.mode.as_str().into(), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(points::GUIDER_MODE),
            &args.mode.as_str().into(),
            Self::KIND,
        )
        .await
    }
}

/// Arguments of [`SetAgitator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgitatorArgs {
    pub enabled: bool,
}

/// Switch the fiber agitator on or off.
pub struct SetAgitator;

#[async_trait]
impl Action for SetAgitator {
    type Args = AgitatorArgs;
    const NAME: &'static str = "set_agitator";
    const KIND: ActionKind = ActionKind::Agitator;

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.bus()
            .write(points::AGITATOR, args.enabled.into(), false)
            .await
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        ctx.confirm(
            &points::readback(points::AGITATOR),
            &args.enabled.into(),
            Self::KIND,
        )
        .await
    }
}
