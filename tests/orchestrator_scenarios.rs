//! End-to-end runs against the simulated instrument.

mod common;

use common::{lamp_a_calibration, ob, science_block, Harness};
use ob_sequencer::bus::points::{self, Shutter};
use ob_sequencer::bus::{BusValue, MockBus};
use ob_sequencer::ob::{CalSource, Detector, StepGroup, StepRef};
use ob_sequencer::orchestrator::{
    OrchestratorSettings, PhaseState, RunOutcome, SkipReason, StepStatus,
};
use ob_sequencer::action::{ActionKind, ActionTimeouts};
use ob_sequencer::{FailureKind, SequencerError};
use serde_json::json;
use std::time::Duration;

async fn assert_lock_clear(harness: &Harness) {
    let status = harness.orchestrator.lock().status().await.unwrap();
    assert!(status.is_free(), "lock still held by {:?}", status.holder);
    assert!(!status.cancel_requested);
}

fn request_stop_on_first_exposure(bus: &MockBus) {
    bus.on_write(points::EXPOSE_START, |value, state| {
        if value.as_bool() == Some(true) {
            state.set(points::SCRIPT_STOP, true);
        }
    });
}

#[tokio::test(start_paused = true)]
async fn test_lamp_calibration_runs_to_completion() {
    let harness = Harness::new();

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.outcome());
    assert_eq!(report.outcome(), &RunOutcome::Completed);
    let step = report
        .step(StepRef::new(StepGroup::Calibration, 0))
        .unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.exposures_completed, 2);

    // Source and filters configured once, then released.
    assert_eq!(
        harness.values_written(points::CAL_SOURCE),
        vec![BusValue::from("LampA"), BusValue::from("Home")]
    );
    assert_eq!(
        harness.values_written(points::ND1),
        vec![BusValue::from("0.1"), BusValue::from("OPEN")]
    );
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 2);
    assert_eq!(
        harness.bus.get(&points::lamp_status(CalSource::LampA)),
        Some(BusValue::from("Off"))
    );
    assert_eq!(harness.bus.get(points::FRAME_NUMBER), Some(BusValue::Int(2)));

    assert_eq!(harness.orchestrator.state(), PhaseState::Idle);
    assert_eq!(
        harness.orchestrator.phase_history(),
        vec![
            PhaseState::Idle,
            PhaseState::Configuring,
            PhaseState::Executing,
            PhaseState::CleaningUp,
            PhaseState::Idle,
        ]
    );
    assert!(report.lock_released);
    assert!(report.finished_at.is_some());
    assert_lock_clear(&harness).await;
    assert_eq!(harness.alerts.count(), 0);
    assert!(report.into_result().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_first_exposure_starts() {
    let harness = Harness::new();
    request_stop_on_first_exposure(&harness.bus);

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    assert!(matches!(report.outcome(), RunOutcome::Cancelled { .. }));
    let step = report
        .step(StepRef::new(StepGroup::Calibration, 0))
        .unwrap();
    assert_eq!(step.status, StepStatus::Cancelled);
    // The in-flight exposure completed; the second was never started.
    assert_eq!(step.exposures_completed, 1);
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 1);
    assert_eq!(harness.bus.get(points::FRAME_NUMBER), Some(BusValue::Int(1)));

    // Cleanup ran to completion.
    assert!(!report.cleanup.is_empty());
    assert!(report.cleanup.iter().all(|entry| entry.succeeded()));
    assert_eq!(
        harness.values_written(points::CAL_SOURCE).last(),
        Some(&BusValue::from("Home"))
    );

    assert_eq!(harness.alerts.count(), 0);
    assert_eq!(report.alerts_sent, 0);
    assert_eq!(harness.orchestrator.state(), PhaseState::Idle);
    assert_lock_clear(&harness).await;

    let err = report.into_result().unwrap_err();
    assert_eq!(err.kind(), FailureKind::Cancellation);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_execute_issues_no_exposure() {
    let harness = Harness::new();
    // Stop while configuring; the first breakpoint after that is in execute.
    harness
        .bus
        .on_write(&points::lamp_power(CalSource::LampA), |value, state| {
            if value.as_bool() == Some(true) {
                state.set(points::SCRIPT_STOP, true);
            }
        });

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    assert!(matches!(report.outcome(), RunOutcome::Cancelled { .. }));
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 0);
    assert_eq!(report.steps[0].status, StepStatus::Cancelled);
    assert_eq!(
        harness.orchestrator.phase_history(),
        vec![
            PhaseState::Idle,
            PhaseState::Configuring,
            PhaseState::Executing,
            PhaseState::CleaningUp,
            PhaseState::Idle,
        ]
    );
    assert_eq!(report.steps[0].exposures_completed, 0);
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_ready_wait_starts_no_exposure() {
    let harness = Harness::new();
    // Detectors stay busy for 2 s after the object is set; the stop request
    // lands while the runner is waiting for them.
    harness.bus.on_write(points::OBJECT, |_, state| {
        state.set(points::EXPOSE_STATUS, "Busy");
        state.schedule(Duration::from_secs(1), points::SCRIPT_STOP, true);
        state.schedule(Duration::from_secs(2), points::EXPOSE_STATUS, "Ready");
    });

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    assert!(matches!(report.outcome(), RunOutcome::Cancelled { .. }));
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 0);
    assert_eq!(report.steps[0].status, StepStatus::Cancelled);
    assert_eq!(report.steps[0].exposures_completed, 0);
    assert_eq!(
        harness.values_written(points::CAL_SOURCE).last(),
        Some(&BusValue::from("Home"))
    );
    assert_eq!(harness.alerts.count(), 0);
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_lamp_warmup_skips_remaining_configuration() {
    let harness = Harness::new();
    harness
        .bus
        .on_write(&points::lamp_power(CalSource::LampA), |value, state| {
            if value.as_bool() == Some(true) {
                state.schedule(Duration::from_secs(1), points::SCRIPT_STOP, true);
            }
        });

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    assert!(matches!(report.outcome(), RunOutcome::Cancelled { .. }));
    assert_eq!(report.steps[0].status, StepStatus::Cancelled);
    // Only cleanup touched the bench after the warm-up.
    assert_eq!(
        harness.values_written(points::CAL_SOURCE),
        vec![BusValue::from("Home")]
    );
    assert_eq!(
        harness.values_written(points::ND1),
        vec![BusValue::from("OPEN")]
    );
    assert_eq!(harness.bus.writes_to(points::OBJECT), 0);
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 0);
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_lamp_warmup_timeout_is_fatal() {
    let mut harness = Harness::new();
    let mut timeouts = ActionTimeouts::default();
    timeouts.set(ActionKind::LampWarmup, Duration::from_secs(10));
    harness.orchestrator = harness.orchestrator.with_timeouts(timeouts);
    let status = points::lamp_status(CalSource::LampA);
    harness.bus.set(&status, "Warming");
    harness.bus.jam(&status);

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    let failure = report.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::DestinationTimeout);
    assert_eq!(failure.expected.as_deref(), Some("Warm"));
    assert_eq!(failure.actual.as_deref(), Some("Warming"));
    assert_eq!(failure.step, Some(StepRef::new(StepGroup::Calibration, 0)));
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 0);
    assert_eq!(harness.alerts.count(), 1);

    // Cleanup switched the lamp off again.
    let power = points::lamp_power(CalSource::LampA);
    assert_eq!(
        harness.values_written(&power),
        vec![BusValue::from(true), BusValue::from(false)]
    );
    assert_eq!(
        harness.bus.get(&points::readback(&power)),
        Some(BusValue::from(false))
    );
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_incompatible_version_rejected_before_lock() {
    let harness = Harness::new();
    let block = ob(json!({
        "templateName": "calibration",
        "templateVersion": "0.2",
        "calibrationSteps": [{"source": "LampA", "exposureCount": 1, "exposureTime": 5}]
    }));

    let err = harness
        .orchestrator
        .run_observing_block(&block, "calibrate")
        .await
        .unwrap_err();

    assert!(matches!(err, SequencerError::Validation(_)));
    assert!(harness.bus.writes().is_empty());
    assert_eq!(harness.orchestrator.phase_history(), vec![PhaseState::Idle]);
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_source_skips_only_that_step() {
    let harness = Harness::new();
    harness.sim.disable_source(CalSource::ThAr);
    let block = ob(json!({
        "templateName": "calibration",
        "templateVersion": "0.5",
        "calibrationSteps": [
            {"source": "LampA", "exposureCount": 1, "exposureTime": 5},
            {"source": "ThAr", "exposureCount": 2, "exposureTime": 5},
            {"source": "Etalon", "exposureCount": 1, "exposureTime": 5}
        ]
    }));

    let report = harness
        .orchestrator
        .run_observing_block(&block, "calibrate")
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.steps_with_status(StepStatus::Completed), 2);
    let skipped = report
        .step(StepRef::new(StepGroup::Calibration, 1))
        .unwrap();
    assert_eq!(
        skipped.status,
        StepStatus::Skipped(SkipReason::SourceDisabled {
            source: CalSource::ThAr
        })
    );
    assert!(!skipped.issued_commands());
    assert_eq!(report.steps.iter().filter(|s| s.issued_commands()).count(), 2);

    assert_eq!(harness.bus.writes_to(&points::lamp_power(CalSource::ThAr)), 0);
    assert!(!harness
        .values_written(points::CAL_SOURCE)
        .contains(&BusValue::from("ThAr")));
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 2);
}

#[tokio::test(start_paused = true)]
async fn test_destination_timeout_alerts_then_cleans_up() {
    let harness = Harness::new();
    harness.bus.jam(&points::readback(points::ND1));

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    let failure = report.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::DestinationTimeout);
    assert_eq!(failure.expected.as_deref(), Some("0.1"));
    assert_eq!(failure.actual.as_deref(), Some("OPEN"));
    assert_eq!(failure.step, Some(StepRef::new(StepGroup::Calibration, 0)));
    assert_eq!(
        report
            .step(StepRef::new(StepGroup::Calibration, 0))
            .unwrap()
            .status,
        StepStatus::Failed
    );
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 0);

    let sent = harness.alerts.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "[obseq] DestinationTimeout in calibration[0]");
    assert!(sent[0].1.contains("Expected: 0.1"));
    assert_eq!(report.alerts_sent, 1);

    // Cleanup ran after the alert and the lamp is off again.
    assert!(report.cleanup.iter().any(|entry| entry.action == "select_cal_source"));
    assert_eq!(
        harness.bus.get(&points::lamp_status(CalSource::LampA)),
        Some(BusValue::from("Off"))
    );
    assert_eq!(harness.orchestrator.state(), PhaseState::Idle);
    assert_lock_clear(&harness).await;

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, SequencerError::DestinationTimeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_leaves_later_steps_not_attempted() {
    let harness = Harness::new();
    harness.bus.fail_writes_to(points::FF_FIBER);
    let block = ob(json!({
        "templateName": "calibration",
        "templateVersion": "0.5",
        "calibrationSteps": [
            {"source": "Etalon", "exposureCount": 1, "exposureTime": 5, "ffFiber": "f/4"},
            {"source": "LampA", "exposureCount": 1, "exposureTime": 5}
        ]
    }));

    let report = harness
        .orchestrator
        .run_observing_block(&block, "calibrate")
        .await
        .unwrap();

    let failure = report.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::UnrecoverableStepFailure);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[1].status, StepStatus::NotAttempted);
    assert_eq!(harness.alerts.count(), 1);
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_detector_fault_recovers_once() {
    let harness = Harness::new();
    harness.sim.inject_detector_fault(Detector::Green, 1);

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.outcome());
    let step = &report.steps[0];
    assert_eq!(step.recoveries, 1);
    assert_eq!(step.exposures_completed, 2);
    assert_eq!(harness.bus.writes_to(&points::detector_reset(Detector::Green)), 1);
    assert_eq!(harness.bus.writes_to(points::EXPOSE_START), 3);
    assert_eq!(harness.alerts.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_detector_fault_is_fatal() {
    let harness = Harness::new();
    harness.sim.inject_detector_fault(Detector::Red, 2);

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    let failure = report.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::UnrecoverableStepFailure);
    assert!(failure.message.contains("red"), "{}", failure.message);
    assert_eq!(report.steps[0].recoveries, 1);
    assert_eq!(report.steps[0].exposures_completed, 0);
    assert_eq!(harness.alerts.count(), 1);
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_detector_recovery_can_be_disabled() {
    let mut harness = Harness::new();
    harness.orchestrator = harness.orchestrator.with_settings(OrchestratorSettings {
        detector_recovery: false,
        ..OrchestratorSettings::default()
    });
    harness.sim.inject_detector_fault(Detector::Green, 1);

    let report = harness
        .orchestrator
        .run_observing_block(&lamp_a_calibration(), "calibrate")
        .await
        .unwrap();

    assert_eq!(
        report.failure().map(|f| f.kind),
        Some(FailureKind::UnrecoverableStepFailure)
    );
    assert_eq!(report.steps[0].recoveries, 0);
    assert_eq!(harness.bus.writes_to(&points::detector_reset(Detector::Green)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_science_block_acquires_and_releases_target() {
    let harness = Harness::new();

    let report = harness
        .orchestrator
        .run_observing_block(&science_block(), "science")
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.outcome());
    assert_eq!(
        harness.bus.get(&points::target("name")),
        Some(BusValue::from("HD 10700"))
    );
    assert_eq!(
        harness.values_written(points::OBJECT),
        vec![BusValue::from("HD 10700")]
    );
    // Auto ND for a bright star, then opened again by cleanup.
    assert_eq!(
        harness.values_written(points::ND1),
        vec![BusValue::from("0.1"), BusValue::from("OPEN")]
    );
    assert_eq!(
        harness.values_written(&points::shutter(Shutter::Science)),
        vec![BusValue::from(true), BusValue::from(false)]
    );
    assert_eq!(
        harness.values_written(points::GUIDER_MODE),
        vec![BusValue::from("auto"), BusValue::from("off")]
    );
    assert_eq!(
        harness.values_written(points::AGITATOR),
        vec![BusValue::from(true), BusValue::from(false)]
    );
    assert_lock_clear(&harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_source_on_keeps_lamp_powered() {
    let harness = Harness::new();
    let mut block = lamp_a_calibration();
    block.leave_source_on = true;

    let report = harness
        .orchestrator
        .run_observing_block(&block, "calibrate")
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(
        harness.values_written(&points::lamp_power(CalSource::LampA)),
        vec![BusValue::from(true)]
    );
    assert_eq!(
        harness.bus.get(&points::lamp_status(CalSource::LampA)),
        Some(BusValue::from("Warm"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_is_reported_and_lock_still_released() {
    let harness = Harness::new();
    // Writes to the agitator fail: acquisition fails, and so does cleanup's
    // attempt to switch it off.
    harness.bus.fail_writes_to(points::AGITATOR);

    let report = harness
        .orchestrator
        .run_observing_block(&science_block(), "science")
        .await
        .unwrap();

    assert!(report.failure().is_some());
    assert_eq!(report.steps_with_status(StepStatus::NotAttempted), 1);
    let agitator = report
        .cleanup
        .iter()
        .find(|entry| entry.action == "set_agitator")
        .unwrap();
    assert!(!agitator.succeeded());
    // Other cleanup actions were still attempted.
    assert!(report
        .cleanup
        .iter()
        .filter(|entry| entry.action != "set_agitator")
        .all(|entry| entry.succeeded()));
    assert!(report.lock_released);
    assert_lock_clear(&harness).await;
    // One alert for the failed acquisition, one for the failed cleanup.
    let sent = harness.alerts.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].1.contains("cleanup failed"));
}
