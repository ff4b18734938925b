//! Simulated instrument
//!
//! Installs instrument-like behaviour on a [`MockBus`] so the orchestrator can run
//! complete observing blocks without hardware. All timing uses `tokio::time`, so
//! tests running with `start_paused = true` complete instantly.
//!
//! # Behaviour
//!
//! - Command points mirror onto their readbacks after the mechanism delay
//! - Lamps report `Warming` when powered and `Warm` after the warm-up delay
//! - `expose.start` runs an exposure: `InProgress` for the exposure time,
//!   `Readout` for the readout time, then `Ready` with the frame number advanced
//! - Injected detector faults turn the next exposure into `Error`
//! - `expose.abort` and `detector.<name>.reset` recover from faults
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = MockBus::new();
//! let sim = SimulatedInstrument::install(&bus, SimTiming::default());
//! sim.disable_source(CalSource::LampB);
//! sim.inject_detector_fault(Detector::Green, 1);
//! ```

use super::mock::{MockBus, MockState};
use super::points::{self, Shutter};
use super::BusValue;
use crate::ob::{CalSource, Detector, NdFilter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Timing characteristics of the simulated instrument.
#[derive(Debug, Clone, Copy)]
pub struct SimTiming {
    /// Delay before a readback reflects its command.
    pub mechanism: Duration,
    /// Lamp warm-up time.
    pub lamp_warmup: Duration,
    /// Detector readout time.
    pub readout: Duration,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            mechanism: Duration::from_millis(200),
            lamp_warmup: Duration::from_secs(5),
            readout: Duration::from_secs(2),
        }
    }
}

type FaultPlan = Arc<Mutex<HashMap<Detector, u32>>>;

/// Handle to the behaviour installed on a [`MockBus`].
pub struct SimulatedInstrument {
    bus: MockBus,
    faults: FaultPlan,
}

impl SimulatedInstrument {
    /// Create a fresh bus with the simulated instrument installed.
    pub fn new_bus(timing: SimTiming) -> (MockBus, Self) {
        let bus = MockBus::new().with_mirror(timing.mechanism);
        let sim = Self::install(&bus, timing);
        (bus, sim)
    }

    /// Seed idle values and install behaviour hooks on `bus`.
    ///
    /// The bus should mirror command points (see [`MockBus::with_mirror`]);
    /// [`SimulatedInstrument::new_bus`] does this for you.
    pub fn install(bus: &MockBus, timing: SimTiming) -> Self {
        let faults: FaultPlan = Arc::new(Mutex::new(HashMap::new()));

        Self::seed_idle_values(bus);
        Self::install_lamps(bus, timing);
        Self::install_exposure(bus, timing, faults.clone());

        for detector in Detector::ALL {
            bus.on_write(&points::detector_reset(detector), move |value, state| {
                if value.as_bool() != Some(true) {
                    return;
                }
                state.set(&points::detector_status(detector), "Ready");
                let any_faulted = Detector::ALL.iter().any(|d| {
                    state
                        .get(&points::detector_status(*d))
                        .map(|v| v.matches(&BusValue::from("Error")))
                        .unwrap_or(false)
                });
                if !any_faulted {
                    state.set(points::EXPOSE_STATUS, "Ready");
                }
            });
        }

        Self {
            bus: bus.clone(),
            faults,
        }
    }

    fn seed_idle_values(bus: &MockBus) {
        let with_rb = |point: &str, value: BusValue| {
            bus.set(point, value.clone());
            bus.set(&points::readback(point), value);
        };

        with_rb(points::CAL_SOURCE, CalSource::Home.as_str().into());
        with_rb(points::ND1, NdFilter::Open.as_str().into());
        with_rb(points::ND2, NdFilter::Open.as_str().into());
        with_rb(points::FF_FIBER, "Blank".into());
        for shutter in Shutter::ALL {
            with_rb(&points::shutter(shutter), false.into());
        }
        for detector in Detector::ALL {
            with_rb(&points::trigger(detector), false.into());
            bus.set(&points::detector_status(detector), "Ready");
            bus.set(&points::detector_reset(detector), false);
        }
        for source in CalSource::ALL.iter().filter(|s| s.is_lamp()) {
            with_rb(&points::lamp_power(*source), false.into());
            bus.set(&points::lamp_status(*source), "Off");
        }
        for source in CalSource::ALL {
            bus.set(&points::lamp_enabled(source), true);
        }

        with_rb(points::EXPOSURE_TIME, BusValue::Float(0.0));
        with_rb(points::EXPMETER_MODE, "off".into());
        with_rb(points::EXPMETER_TIME, BusValue::Float(0.0));
        with_rb(points::GUIDER_MODE, "off".into());
        with_rb(points::AGITATOR, false.into());
        bus.set(points::OBJECT, "");
        bus.set(points::EXPOSE_START, false);
        bus.set(points::EXPOSE_ABORT, false);
        bus.set(points::EXPOSE_STATUS, "Ready");
        bus.set(points::FRAME_NUMBER, BusValue::Int(0));
        for field in crate::action::acquisition::TARGET_FIELDS {
            bus.set(&points::target(field), "");
        }

        bus.set(points::SCRIPT_NAME, "");
        bus.set(points::SCRIPT_PID, BusValue::Int(0));
        bus.set(points::SCRIPT_HOST, "");
        bus.set(points::SCRIPT_MSG, "");
        bus.set(points::SCRIPT_STOP, false);
    }

    fn install_lamps(bus: &MockBus, timing: SimTiming) {
        for source in CalSource::ALL.iter().copied().filter(|s| s.is_lamp()) {
            let status = points::lamp_status(source);
            bus.on_write(&points::lamp_power(source), move |value, state| {
                state.cancel_scheduled(&status);
                if value.as_bool() == Some(true) {
                    let already_warm = state
                        .get(&status)
                        .map(|v| v.matches(&BusValue::from("Warm")))
                        .unwrap_or(false);
                    if !already_warm {
                        state.set(&status, "Warming");
                        state.schedule(timing.lamp_warmup, &status, "Warm");
                    }
                } else {
                    state.set(&status, "Off");
                }
            });
        }
    }

    fn install_exposure(bus: &MockBus, timing: SimTiming, faults: FaultPlan) {
        bus.on_write(points::EXPOSE_START, move |value, state| {
            if value.as_bool() != Some(true) {
                return;
            }

            let faulted = {
                let mut plan = faults.lock();
                let hit = plan.iter().find(|(_, n)| **n > 0).map(|(d, _)| *d);
                if let Some(detector) = hit {
                    if let Some(n) = plan.get_mut(&detector) {
                        *n -= 1;
                    }
                }
                hit
            };

            if let Some(detector) = faulted {
                state.set(&points::detector_status(detector), "Error");
                state.set(points::EXPOSE_STATUS, "InProgress");
                state.schedule(timing.readout, points::EXPOSE_STATUS, "Error");
                return;
            }

            let exptime = state
                .get(points::EXPOSURE_TIME)
                .and_then(BusValue::as_f64)
                .unwrap_or(0.0)
                .max(0.0);
            let frame = state
                .get(points::FRAME_NUMBER)
                .and_then(BusValue::as_i64)
                .unwrap_or(0);
            let exposure = Duration::from_secs_f64(exptime);

            state.set(points::EXPOSE_STATUS, "InProgress");
            state.schedule(exposure, points::EXPOSE_STATUS, "Readout");
            state.schedule(exposure + timing.readout, points::FRAME_NUMBER, frame + 1);
            state.schedule(exposure + timing.readout, points::EXPOSE_STATUS, "Ready");
        });

        bus.on_write(points::EXPOSE_ABORT, |value, state: &mut MockState| {
            if value.as_bool() != Some(true) {
                return;
            }
            state.cancel_scheduled(points::EXPOSE_STATUS);
            state.cancel_scheduled(points::FRAME_NUMBER);
            let in_error = state
                .get(points::EXPOSE_STATUS)
                .map(|v| v.matches(&BusValue::from("Error")))
                .unwrap_or(false);
            if !in_error {
                state.set(points::EXPOSE_STATUS, "Ready");
            }
        });
    }

    /// Administratively disable a calibration source.
    pub fn disable_source(&self, source: CalSource) {
        self.bus.set(&points::lamp_enabled(source), false);
    }

    /// Make the next `count` exposures fault on `detector`.
    pub fn inject_detector_fault(&self, detector: Detector, count: u32) {
        *self.faults.lock().entry(detector).or_insert(0) += count;
    }

    /// The bus this instrument is installed on.
    pub fn bus(&self) -> &MockBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeviceBus;

    #[tokio::test(start_paused = true)]
    async fn test_exposure_advances_frame_number() {
        let (bus, _sim) = SimulatedInstrument::new_bus(SimTiming::default());
        bus.write(points::EXPOSURE_TIME, BusValue::Float(5.0), false)
            .await
            .unwrap();
        bus.write(points::EXPOSE_START, BusValue::Bool(true), false)
            .await
            .unwrap();
        assert_eq!(bus.get(points::EXPOSE_STATUS), Some("InProgress".into()));

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(bus.get(points::EXPOSE_STATUS), Some("Ready".into()));
        assert_eq!(bus.get(points::FRAME_NUMBER), Some(BusValue::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lamp_warms_up() {
        let (bus, _sim) = SimulatedInstrument::new_bus(SimTiming::default());
        let power = points::lamp_power(CalSource::LampA);
        let status = points::lamp_status(CalSource::LampA);

        bus.write(&power, BusValue::Bool(true), false).await.unwrap();
        assert_eq!(bus.get(&status), Some("Warming".into()));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(bus.get(&status), Some("Warm".into()));

        bus.write(&power, BusValue::Bool(false), false).await.unwrap();
        assert_eq!(bus.get(&status), Some("Off".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_fault_and_reset() {
        let (bus, sim) = SimulatedInstrument::new_bus(SimTiming::default());
        sim.inject_detector_fault(Detector::Green, 1);

        bus.write(points::EXPOSE_START, BusValue::Bool(true), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(bus.get(points::EXPOSE_STATUS), Some("Error".into()));
        assert_eq!(
            bus.get(&points::detector_status(Detector::Green)),
            Some("Error".into())
        );

        bus.write(points::EXPOSE_ABORT, BusValue::Bool(true), false)
            .await
            .unwrap();
        bus.write(&points::detector_reset(Detector::Green), BusValue::Bool(true), false)
            .await
            .unwrap();
        assert_eq!(bus.get(points::EXPOSE_STATUS), Some("Ready".into()));
    }
}
