//! Invocation of actions by name.

use super::acquisition::{SetAgitator, SetGuiding, SetTarget};
use super::calibration::{SelectCalSource, SetFfFiber, SetLampPower, SetNdFilters, WaitForLampWarm};
use super::detector::{
    AbortExposure, ResetDetector, SetExpMeter, SetExposureTime, SetObject, SetTriggeredDetectors,
    StartExposure, WaitForReadout, WaitForReady,
};
use super::shutters::ConfigureShutters;
use super::{execute, Action, ActionContext, ActionKind};
use crate::error::{SequencerError, SequencerResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

/// Object-safe view of an [`Action`] taking JSON arguments.
#[async_trait]
pub trait DynAction: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> ActionKind;
    async fn invoke(&self, ctx: &ActionContext, args: serde_json::Value) -> SequencerResult<()>;
}

#[async_trait]
impl<A: Action> DynAction for A {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn kind(&self) -> ActionKind {
        A::KIND
    }

    async fn invoke(&self, ctx: &ActionContext, args: serde_json::Value) -> SequencerResult<()> {
        let args: A::Args = serde_json::from_value(args).map_err(|e| {
            SequencerError::validation(format!("{}: invalid arguments: {e}", A::NAME))
        })?;
        execute(self, ctx, &args).await
    }
}

/// Actions by name.
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, Box<dyn DynAction>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtin_actions()
    }
}

impl ActionRegistry {
    /// Registry with no actions.
    pub fn empty() -> Self {
        Self {
            actions: BTreeMap::new(),
        }
    }

    /// Registry holding every primitive action of the instrument.
    pub fn with_builtin_actions() -> Self {
        let mut registry = Self::empty();
        registry.register(SelectCalSource);
        registry.register(SetLampPower);
        registry.register(WaitForLampWarm);
        registry.register(SetNdFilters);
        registry.register(SetFfFiber);
        registry.register(ConfigureShutters);
        registry.register(SetTriggeredDetectors);
        registry.register(SetExposureTime);
        registry.register(SetObject);
        registry.register(SetExpMeter);
        registry.register(WaitForReady);
        registry.register(StartExposure);
        registry.register(WaitForReadout);
        registry.register(AbortExposure);
        registry.register(ResetDetector);
        registry.register(SetTarget);
        registry.register(SetGuiding);
        registry.register(SetAgitator);
        registry
    }

    /// Register `action` under its name, replacing any previous one.
    pub fn register<A: Action + 'static>(&mut self, action: A) {
        self.actions.insert(A::NAME, Box::new(action));
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<&dyn DynAction> {
        self.actions.get(name).map(|a| a.as_ref())
    }

    /// Registered actions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn DynAction> {
        self.actions.values().map(|a| a.as_ref())
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run the named action with JSON arguments.
    pub async fn invoke(
        &self,
        ctx: &ActionContext,
        name: &str,
        args: serde_json::Value,
    ) -> SequencerResult<()> {
        let action = self
            .get(name)
            .ok_or_else(|| SequencerError::validation(format!("unknown action '{name}'")))?;
        info!(action = name, "Invoking action");
        action.invoke(ctx, args).await
    }
}
