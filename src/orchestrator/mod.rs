//! Phase orchestrator.
//!
//! Drives one observing block through `Configuring -> Executing -> CleaningUp`
//! while holding the execution lock.
//!
//! # Run sequence
//!
//! 1. Validate the block. A [`SequencerError::Validation`] returns before the
//!    lock is touched and before any device write.
//! 2. Acquire the execution lock ([`SequencerError::LockHeld`] if taken).
//! 3. Configure the calibration bench and, for science, acquire the target.
//! 4. Execute darks, calibrations and science steps in order, checking for
//!    cancellation at breakpoints.
//! 5. Alert on unrecoverable step failures and destination timeouts.
//! 6. Clean up. Every cleanup action is attempted independently.
//! 7. Release the lock, falling back to a forced clear, and return to `Idle`.
//!
//! Steps 6 and 7 run on every path that reached the lock: success, step
//! failure and cancellation. A run future that is dropped mid-way releases the
//! lock through the guard's `Drop`.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(bus, Arc::new(TracingAlertSink));
//! let report = orchestrator.run_observing_block(&ob, "calibrate").await?;
//! report.into_result()?;
//! ```

mod cleanup;
mod configure;
mod execute;
pub mod report;
pub mod state;

pub use report::{
    CleanupEntry, FailureRecord, RunOutcome, RunReport, SkipReason, StepOutcome, StepStatus,
};
pub use state::{PhaseState, PhaseTracker};

use crate::action::{ActionContext, ActionTimeouts};
use crate::alert::{dispatch, Alert, AlertSink};
use crate::bus::DeviceBus;
use crate::config::SequencerConfig;
use crate::error::{SequencerError, SequencerResult};
use crate::lock::{CancellationSignal, ExecutionLock, LockGuard, LockIdentity};
use crate::ob::{default_minimum_versions, MinimumVersions, ObservingBlock, StepRef};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Why the step loop stopped early.
#[derive(Debug)]
pub(crate) enum Interrupt {
    Cancel(CancellationSignal),
    Fault {
        error: SequencerError,
        step: Option<StepRef>,
    },
}

impl Interrupt {
    /// Attribute a fault to `step`.
    pub(crate) fn at(self, step: StepRef) -> Self {
        match self {
            Interrupt::Fault { error, step: None } => Interrupt::Fault {
                error: error.in_step(step),
                step: Some(step),
            },
            other => other,
        }
    }
}

impl From<SequencerError> for Interrupt {
    fn from(error: SequencerError) -> Self {
        Interrupt::Fault { error, step: None }
    }
}

/// Check for cancellation.
pub(crate) async fn breakpoint(lock: &ExecutionLock) -> Result<(), Interrupt> {
    match lock.check_cancellation().await? {
        Some(signal) => Err(Interrupt::Cancel(signal)),
        None => Ok(()),
    }
}

/// Behaviour switches of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Oldest accepted template version per template.
    pub minimum_versions: MinimumVersions,
    /// Attempt one abort/reset/restart cycle on a detector fault.
    pub detector_recovery: bool,
    /// Power the lamps used by the block while configuring.
    pub prepower_lamps: bool,
    /// Send alerts for alertable failures.
    pub alerts_enabled: bool,
    /// Prefix of every alert subject line.
    pub alert_subject_prefix: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            minimum_versions: default_minimum_versions(),
            detector_recovery: true,
            prepower_lamps: true,
            alerts_enabled: true,
            alert_subject_prefix: "[obseq]".to_string(),
        }
    }
}

/// Runs observing blocks against the instrument.
pub struct Orchestrator {
    ctx: ActionContext,
    lock: ExecutionLock,
    alerts: Arc<dyn AlertSink>,
    settings: OrchestratorSettings,
    phase: PhaseTracker,
}

impl Orchestrator {
    /// Orchestrator with default settings and timeouts.
    pub fn new(bus: Arc<dyn DeviceBus>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            ctx: ActionContext::new(bus.clone()),
            lock: ExecutionLock::new(bus),
            alerts,
            settings: OrchestratorSettings::default(),
            phase: PhaseTracker::new(),
        }
    }

    /// Orchestrator configured from a loaded [`SequencerConfig`].
    pub fn from_config(
        bus: Arc<dyn DeviceBus>,
        alerts: Arc<dyn AlertSink>,
        config: &SequencerConfig,
    ) -> Self {
        Self::new(bus, alerts)
            .with_timeouts(config.timeouts.clone())
            .with_settings(config.orchestrator_settings())
    }

    /// Replace the behaviour switches.
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the confirmation timeouts used by every action.
    pub fn with_timeouts(mut self, timeouts: ActionTimeouts) -> Self {
        self.ctx = self.ctx.with_timeouts(timeouts);
        self
    }

    /// Active behaviour switches.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Context the primitive actions run with.
    pub fn context(&self) -> &ActionContext {
        &self.ctx
    }

    /// The execution lock shared with other scripts.
    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    /// Current phase.
    pub fn state(&self) -> PhaseState {
        self.phase.get()
    }

    /// Receiver notified on every phase change.
    pub fn subscribe(&self) -> watch::Receiver<PhaseState> {
        self.phase.subscribe()
    }

    /// Every phase entered since construction, starting with `Idle`.
    pub fn phase_history(&self) -> Vec<PhaseState> {
        self.phase.history()
    }

    /// Ask a running block to stop at its next breakpoint.
    pub async fn request_cancel(&self) -> SequencerResult<()> {
        self.lock.request_cancel().await
    }

    /// Run `ob` under the execution lock.
    ///
    /// Returns `Err` only for failures before the lock was taken (validation,
    /// lock held). Once the lock is held a [`RunReport`] is always returned;
    /// use [`RunReport::into_result`] to turn its outcome into a typed error.
    #[instrument(skip_all, fields(script = script_name))]
    pub async fn run_observing_block(
        &self,
        ob: &ObservingBlock,
        script_name: &str,
    ) -> SequencerResult<RunReport> {
        let plan = ob.validate(&self.settings.minimum_versions).map_err(|e| {
            warn!(error = %e, "Observing block rejected");
            e
        })?;
        info!(ob = %plan.identity, steps = plan.step_count(), "Observing block validated");

        let mut guard = self
            .lock
            .acquire(LockIdentity::current(script_name, &plan.identity))
            .await?;
        let mut report = RunReport::new(&plan, script_name);
        info!(run_uid = %report.run_uid, "Run started");

        self.phase.transition(PhaseState::Configuring);
        let mut result = configure::configure(
            &self.ctx,
            &self.lock,
            &plan,
            self.settings.prepower_lamps,
        )
        .await;

        if result.is_ok() {
            self.phase.transition(PhaseState::Executing);
            let mut runner =
                execute::StepRunner::new(&self.ctx, &self.lock, self.settings.detector_recovery);
            result = runner.run(&plan, &mut report).await;
        }

        match result {
            Ok(()) => info!(exposures = report.exposures_completed(), "All steps completed"),
            Err(Interrupt::Cancel(signal)) => {
                info!(%signal, "Run cancelled");
                report.record_cancel(signal);
            }
            Err(Interrupt::Fault { error, step }) => {
                error!(error = %error, step = ?step, "Run failed");
                let kind = error.kind();
                report.record_failure(error, step);
                if kind.is_alertable() {
                    self.alert_failure(&mut report).await;
                }
            }
        }

        self.phase.transition(PhaseState::CleaningUp);
        let (entries, errors) = cleanup::run_cleanup(&self.ctx, &plan).await;
        report.cleanup = entries;
        if !errors.is_empty() {
            self.alert_cleanup(&mut report, &errors).await;
        }
        report.cleanup_errors = errors;

        report.lock_released = self.release_lock(&mut guard).await;
        report.finished_at = Some(Utc::now());
        self.phase.transition(PhaseState::Idle);

        info!(
            run_uid = %report.run_uid,
            success = report.is_success(),
            exposures = report.exposures_completed(),
            "Run finished"
        );
        Ok(report)
    }

    async fn alert_failure(&self, report: &mut RunReport) {
        if !self.settings.alerts_enabled {
            return;
        }
        let Some(failure) = report.failure() else {
            return;
        };
        let alert = Alert {
            kind: failure.kind,
            message: failure.message.clone(),
            ob_identity: report.ob_identity.clone(),
            step: failure.step,
            expected: failure.expected.clone(),
            actual: failure.actual.clone(),
            run_uid: report.run_uid,
        };
        if dispatch(self.alerts.as_ref(), &alert, &self.settings.alert_subject_prefix).await {
            report.alerts_sent += 1;
        }
    }

    async fn alert_cleanup(&self, report: &mut RunReport, errors: &[SequencerError]) {
        if !self.settings.alerts_enabled {
            return;
        }
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        let alert = Alert {
            kind: errors
                .first()
                .map(|e| e.kind())
                .unwrap_or(crate::error::FailureKind::UnrecoverableStepFailure),
            message: format!("cleanup failed: {message}"),
            ob_identity: report.ob_identity.clone(),
            step: None,
            expected: None,
            actual: None,
            run_uid: report.run_uid,
        };
        if dispatch(self.alerts.as_ref(), &alert, &self.settings.alert_subject_prefix).await {
            report.alerts_sent += 1;
        }
    }

    /// Release the lock, independently of how cleanup went.
    async fn release_lock(&self, guard: &mut LockGuard) -> bool {
        match guard.release().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Lock release failed; forcing clear");
                match guard.force_release().await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(error = %e, "Forced lock clear failed; operator action required");
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::bus::sim::SimTiming;
    use crate::bus::{points, SimulatedInstrument};
    use crate::ob::CalSource;
    use serde_json::json;
    use tracing_test::traced_test;

    fn calibration_ob(source: &str) -> ObservingBlock {
        ObservingBlock::from_value(json!({
            "templateName": "calibration",
            "templateVersion": "0.5",
            "calibrationSteps": [{"source": source, "exposureCount": 2, "exposureTime": 5}]
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_cancel_is_logged_but_not_alerted() {
        let (bus, _sim) = SimulatedInstrument::new_bus(SimTiming::default());
        bus.on_write(points::EXPOSE_START, |_, state| {
            state.set(points::SCRIPT_STOP, true);
        });
        let alerts = Arc::new(MemoryAlertSink::new());
        let orchestrator = Orchestrator::new(Arc::new(bus), alerts.clone());

        let report = orchestrator
            .run_observing_block(&calibration_ob("ThAr"), "calibrate")
            .await
            .unwrap();

        assert!(matches!(report.outcome(), RunOutcome::Cancelled { .. }));
        assert_eq!(alerts.count(), 0);
        assert!(logs_contain("Run cancelled"));
        assert!(logs_contain("Run finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_alerts_are_not_sent() {
        let (bus, sim) = SimulatedInstrument::new_bus(SimTiming::default());
        sim.inject_detector_fault(crate::ob::Detector::Green, 2);
        let alerts = Arc::new(MemoryAlertSink::new());
        let orchestrator =
            Orchestrator::new(Arc::new(bus), alerts.clone()).with_settings(OrchestratorSettings {
                alerts_enabled: false,
                ..OrchestratorSettings::default()
            });

        let report = orchestrator
            .run_observing_block(&calibration_ob("LampB"), "calibrate")
            .await
            .unwrap();

        assert!(report.failure().is_some());
        assert_eq!(report.alerts_sent, 0);
        assert_eq!(alerts.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_alert_sink_does_not_block_cleanup() {
        let (bus, sim) = SimulatedInstrument::new_bus(SimTiming::default());
        sim.inject_detector_fault(crate::ob::Detector::Red, 2);
        let orchestrator = Orchestrator::new(Arc::new(bus.clone()), Arc::new(MemoryAlertSink::failing()));

        let report = orchestrator
            .run_observing_block(&calibration_ob("LampC"), "calibrate")
            .await
            .unwrap();

        assert!(report.failure().is_some());
        assert_eq!(report.alerts_sent, 0);
        assert!(report.lock_released);
        assert_eq!(
            bus.get(&points::lamp_status(CalSource::LampC)),
            Some("Off".into())
        );
    }
}
