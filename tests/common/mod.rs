//! Shared helpers for integration tests.

#![allow(dead_code)]

use ob_sequencer::alert::{AlertSink, MemoryAlertSink};
use ob_sequencer::bus::sim::SimTiming;
use ob_sequencer::bus::{BusValue, DeviceBus, MockBus, SimulatedInstrument};
use ob_sequencer::ob::ObservingBlock;
use ob_sequencer::Orchestrator;
use serde_json::{json, Value};
use std::sync::Arc;

/// Orchestrator wired to a simulated instrument and an in-memory alert sink.
pub struct Harness {
    pub bus: MockBus,
    pub sim: SimulatedInstrument,
    pub alerts: Arc<MemoryAlertSink>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let (bus, sim) = SimulatedInstrument::new_bus(SimTiming::default());
        let alerts = Arc::new(MemoryAlertSink::new());
        let shared: Arc<dyn DeviceBus> = Arc::new(bus.clone());
        let sink: Arc<dyn AlertSink> = alerts.clone();
        let orchestrator = Orchestrator::new(shared, sink);
        Self {
            bus,
            sim,
            alerts,
            orchestrator,
        }
    }

    /// Values written to `point`, in order.
    pub fn values_written(&self, point: &str) -> Vec<BusValue> {
        self.bus
            .writes()
            .into_iter()
            .filter(|(p, _)| p == point)
            .map(|(_, v)| v)
            .collect()
    }
}

/// Build an observing block from JSON, panicking on malformed input.
pub fn ob(value: Value) -> ObservingBlock {
    ObservingBlock::from_value(value).expect("test observing block should parse")
}

/// Two 5 s LampA exposures through 0.1 ND filters.
pub fn lamp_a_calibration() -> ObservingBlock {
    ob(json!({
        "templateName": "calibration",
        "templateVersion": "0.5",
        "calibrationSteps": [{
            "source": "LampA",
            "nd1": "0.1",
            "nd2": "0.1",
            "exposureCount": 2,
            "exposureTime": 5
        }]
    }))
}

pub fn science_block() -> ObservingBlock {
    ob(json!({
        "templateName": "science",
        "templateVersion": "1.0",
        "target": {"name": "HD 10700", "gmag": 3.3},
        "scienceSteps": [{
            "exposureCount": 1,
            "exposureTime": 30,
            "expMeterMode": "monitor",
            "expMeterTime": 1,
            "simulCal": true,
            "autoNd": true
        }],
        "simulCalSource": "Etalon",
        "useAgitator": true,
        "guideMode": "auto"
    }))
}
