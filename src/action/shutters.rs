//! Shutter routing.

use super::{Action, ActionContext, ActionKind};
use crate::bus::points::{self, Shutter};
use crate::error::SequencerResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Open/closed state of every shutter. `Default` is all closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShutterRouting {
    /// Science fiber shutter.
    #[serde(default)]
    pub science: bool,
    /// Sky fiber shutter.
    #[serde(default)]
    pub sky: bool,
    /// Calibration light into the science fiber.
    #[serde(default)]
    pub cal_sci: bool,
    /// Calibration light into the sky fiber.
    #[serde(default)]
    pub cal_sky: bool,
    /// Simultaneous calibration fiber.
    #[serde(default)]
    pub simul_cal: bool,
}

impl ShutterRouting {
    /// Every shutter closed.
    pub fn closed() -> Self {
        Self::default()
    }

    /// Requested state of `shutter`.
    pub fn is_open(&self, shutter: Shutter) -> bool {
        match shutter {
            Shutter::Science => self.science,
            Shutter::Sky => self.sky,
            Shutter::CalSci => self.cal_sci,
            Shutter::CalSky => self.cal_sky,
            Shutter::SimulCal => self.simul_cal,
        }
    }
}

/// Drive every shutter to the requested routing.
pub struct ConfigureShutters;

#[async_trait]
impl Action for ConfigureShutters {
    type Args = ShutterRouting;
    const NAME: &'static str = "configure_shutters";
    const KIND: ActionKind = ActionKind::Shutter;

    async fn perform(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        debug!(routing = ?args, "Configuring shutters");
        for shutter in Shutter::ALL {
            ctx.bus()
                .write(&points::shutter(shutter), args.is_open(shutter).into(), false)
                .await?;
        }
        Ok(())
    }

    async fn postcondition(&self, ctx: &ActionContext, args: &Self::Args) -> SequencerResult<()> {
        for shutter in Shutter::ALL {
            ctx.confirm(
                &points::readback(&points::shutter(shutter)),
                &args.is_open(shutter).into(),
                Self::KIND,
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::execute;
    use crate::bus::MockBus;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_routing_writes_every_shutter() {
        let bus = MockBus::new().with_mirror(Duration::from_millis(50));
        for shutter in Shutter::ALL {
            bus.set(&points::readback(&points::shutter(shutter)), false);
        }
        let ctx = ActionContext::new(Arc::new(bus.clone()));
        let routing = ShutterRouting {
            cal_sci: true,
            cal_sky: true,
            ..ShutterRouting::closed()
        };

        execute(&ConfigureShutters, &ctx, &routing).await.unwrap();

        assert_eq!(bus.writes().len(), Shutter::ALL.len());
        assert_eq!(bus.get("shutter.cal_sci.rb"), Some(true.into()));
        assert_eq!(bus.get("shutter.science.rb"), Some(false.into()));
    }
}
