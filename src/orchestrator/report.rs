//! Run reports.
//!
//! Every run that reaches the execution lock produces a [`RunReport`]: run uid,
//! OB identity, timestamps, outcome, per-step accounting and cleanup results.
//! [`RunReport::into_result`] turns the outcome into a typed result for exit
//! statuses.

use crate::error::{FailureKind, SequencerError, SequencerResult};
use crate::lock::CancellationSignal;
use crate::ob::{CalSource, ExecutionPlan, StepRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a step was skipped without being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    SourceDisabled { source: CalSource },
}

/// Final state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    /// Every planned exposure was taken.
    Completed,
    /// Not run, for the given reason.
    Skipped(SkipReason),
    /// The step raised the run's failure.
    Failed,
    /// Stopped by a cancellation with exposures outstanding.
    Cancelled,
    /// The run ended before reaching this step.
    NotAttempted,
}

/// Accounting for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// The step this outcome accounts for.
    pub step: StepRef,
    /// Final state.
    pub status: StepStatus,
    /// Exposures requested by the block.
    pub exposures_planned: u32,
    /// Exposures that finished readout.
    pub exposures_completed: u32,
    /// Detector recoveries performed during this step.
    pub recoveries: u32,
}

impl StepOutcome {
    /// Whether the step sent any command to the instrument.
    pub fn issued_commands(&self) -> bool {
        !matches!(
            self.status,
            StepStatus::Skipped(_) | StepStatus::NotAttempted
        )
    }
}

/// Structured description of a run failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failure category, used for alerting.
    pub kind: FailureKind,
    /// Rendered error message.
    pub message: String,
    /// Value waited for, for destination timeouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Last value observed, for destination timeouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// Step the failure happened in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepRef>,
}

impl FailureRecord {
    /// Record `error`. A step carried by the error wins over `step`.
    pub fn from_error(error: &SequencerError, step: Option<StepRef>) -> Self {
        let (expected, actual) = match error.mismatch() {
            Some((expected, actual)) => (Some(expected.to_string()), Some(actual.to_string())),
            None => (None, None),
        };
        let step = match error {
            SequencerError::StepFailure { step, .. } => Some(*step),
            _ => step,
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            expected,
            actual,
            step,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step ran.
    Completed,
    /// Stopped at a breakpoint.
    Cancelled {
        /// The consumed stop request.
        signal: CancellationSignal,
    },
    /// Stopped by an error.
    Failed {
        /// What went wrong.
        failure: FailureRecord,
    },
}

/// Result of one cleanup action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupEntry {
    /// Name of the cleanup action.
    pub action: String,
    /// Error message when the action failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CleanupEntry {
    /// The action completed without error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything that happened during one observing block run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Unique id of this run, repeated in alerts.
    pub run_uid: Uuid,
    /// Human readable identity of the block.
    pub ob_identity: String,
    /// Name the run registered in the execution lock.
    pub script_name: String,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// Set once cleanup has finished.
    pub finished_at: Option<DateTime<Utc>>,
    outcome: RunOutcome,
    /// One entry per step of the block, in execution order.
    pub steps: Vec<StepOutcome>,
    /// Cleanup actions in the order they ran.
    pub cleanup: Vec<CleanupEntry>,
    /// The execution lock was released at the end of the run.
    pub lock_released: bool,
    /// Alerts delivered for this run.
    pub alerts_sent: usize,
    #[serde(skip)]
    pub(crate) error: Option<SequencerError>,
    #[serde(skip)]
    pub(crate) cleanup_errors: Vec<SequencerError>,
}

impl RunReport {
    /// Fresh report with every step `NotAttempted`.
    pub fn new(plan: &ExecutionPlan, script_name: &str) -> Self {
        let steps = plan
            .steps()
            .map(|s| StepOutcome {
                step: s.step_ref,
                status: StepStatus::NotAttempted,
                exposures_planned: s.spec.exposure_count(),
                exposures_completed: 0,
                recoveries: 0,
            })
            .collect();

        Self {
            run_uid: Uuid::new_v4(),
            ob_identity: plan.identity.clone(),
            script_name: script_name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Completed,
            steps,
            cleanup: Vec::new(),
            lock_released: false,
            alerts_sent: 0,
            error: None,
            cleanup_errors: Vec::new(),
        }
    }

    /// Failed outcomes always carry their error, so only `record_failure` and
    /// `record_cancel` change the outcome.
    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    /// Outcome of `step`, if it belongs to the block.
    pub fn step(&self, step: StepRef) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub(crate) fn step_mut(&mut self, step: StepRef) -> Option<&mut StepOutcome> {
        self.steps.iter_mut().find(|s| s.step == step)
    }

    /// Completed with every cleanup action succeeding.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed) && self.cleanup_errors.is_empty()
    }

    /// Exposures completed over all steps.
    pub fn exposures_completed(&self) -> u32 {
        self.steps.iter().map(|s| s.exposures_completed).sum()
    }

    /// Number of steps that ended in `status`.
    pub fn steps_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// The failure record of a failed run.
    pub fn failure(&self) -> Option<&FailureRecord> {
        match &self.outcome {
            RunOutcome::Failed { failure } => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn record_failure(&mut self, error: SequencerError, step: Option<StepRef>) {
        let failure = FailureRecord::from_error(&error, step);
        self.outcome = RunOutcome::Failed { failure };
        self.error = Some(error);
    }

    pub(crate) fn record_cancel(&mut self, signal: CancellationSignal) {
        self.outcome = RunOutcome::Cancelled { signal };
    }

    /// Convert into a typed result.
    ///
    /// A completed run whose cleanup failed is a [`SequencerError::CleanupFailed`].
    pub fn into_result(mut self) -> SequencerResult<RunReport> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        match &self.outcome {
            RunOutcome::Cancelled { signal } => Err(SequencerError::Cancelled(signal.to_string())),
            _ if !self.cleanup_errors.is_empty() => Err(SequencerError::CleanupFailed(
                std::mem::take(&mut self.cleanup_errors),
            )),
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ob::{default_minimum_versions, ObservingBlock, StepGroup};
    use serde_json::json;
    use std::time::Duration;

    fn plan() -> ExecutionPlan {
        ObservingBlock::from_value(json!({
            "templateName": "calibration",
            "templateVersion": "0.5",
            "calibrationSteps": [
                {"source": "LampA", "exposureCount": 2, "exposureTime": 5},
                {"source": "ThAr", "exposureCount": 3, "exposureTime": 1}
            ]
        }))
        .unwrap()
        .validate(&default_minimum_versions())
        .unwrap()
    }

    #[test]
    fn test_new_report_has_all_steps_not_attempted() {
        let report = RunReport::new(&plan(), "calibrate");
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps_with_status(StepStatus::NotAttempted), 2);
        assert_eq!(report.steps[1].exposures_planned, 3);
        assert!(report.is_success());
    }

    #[test]
    fn test_failure_record_carries_mismatch_and_step() {
        let step = StepRef::new(StepGroup::Calibration, 1);
        let error = SequencerError::DestinationTimeout {
            point: "calbench.nd1.rb".into(),
            expected: "0.1".into(),
            actual: "OPEN".into(),
            timeout: Duration::from_secs(30),
        };
        let record = FailureRecord::from_error(&error, Some(step));
        assert_eq!(record.kind, FailureKind::DestinationTimeout);
        assert_eq!(record.expected.as_deref(), Some("0.1"));
        assert_eq!(record.actual.as_deref(), Some("OPEN"));
        assert_eq!(record.step, Some(step));
    }

    #[test]
    fn test_into_result() {
        let mut report = RunReport::new(&plan(), "calibrate");
        report.record_failure(
            SequencerError::bus("expose.start", "rejected").in_step(StepRef::new(StepGroup::Calibration, 0)),
            None,
        );
        let err = report.into_result().unwrap_err();
        assert_eq!(err.kind(), FailureKind::UnrecoverableStepFailure);

        let report = RunReport::new(&plan(), "calibrate");
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_report_serializes() {
        let report = RunReport::new(&plan(), "calibrate");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"]["outcome"], "completed");
        assert_eq!(value["steps"][0]["status"]["status"], "not_attempted");
    }
}
