//! Well-known control point names.
//!
//! A command point `X` reports its achieved state on `X.rb` (see [`readback`]).
//! Status-only points (lamp status, exposure status, frame number) have no
//! command counterpart.

use crate::ob::{CalSource, Detector};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Calibration bench
// =============================================================================

/// Calibration source selector.
pub const CAL_SOURCE: &str = "calbench.source";
/// First neutral density filter wheel.
pub const ND1: &str = "calbench.nd1";
/// Second neutral density filter wheel.
pub const ND2: &str = "calbench.nd2";
/// Flat-field fiber aperture.
pub const FF_FIBER: &str = "calbench.ff_fiber";

pub fn lamp_power(source: CalSource) -> String {
    format!("calbench.lamp.{}.power", source.point_name())
}

/// Lamp status: `Off`, `Warming` or `Warm`.
pub fn lamp_status(source: CalSource) -> String {
    format!("calbench.lamp.{}.status", source.point_name())
}

/// Administrative enable flag for a calibration source.
pub fn lamp_enabled(source: CalSource) -> String {
    format!("calbench.lamp.{}.enabled", source.point_name())
}

// =============================================================================
// Shutters
// =============================================================================

/// Shutters that route light into the spectrograph fibers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shutter {
    /// Telescope light into the science fiber.
    Science,
    /// Telescope light into the sky fiber.
    Sky,
    /// Calibration light into the science fiber.
    CalSci,
    /// Calibration light into the sky fiber.
    CalSky,
    /// Simultaneous calibration fiber.
    SimulCal,
}

impl Shutter {
    pub const ALL: [Shutter; 5] = [
        Shutter::Science,
        Shutter::Sky,
        Shutter::CalSci,
        Shutter::CalSky,
        Shutter::SimulCal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Shutter::Science => "science",
            Shutter::Sky => "sky",
            Shutter::CalSci => "cal_sci",
            Shutter::CalSky => "cal_sky",
            Shutter::SimulCal => "simulcal",
        }
    }
}

impl fmt::Display for Shutter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn shutter(shutter: Shutter) -> String {
    format!("shutter.{}", shutter.as_str())
}

// =============================================================================
// Exposure control
// =============================================================================

pub const EXPOSURE_TIME: &str = "expose.time";
pub const OBJECT: &str = "expose.object";
pub const EXPOSE_START: &str = "expose.start";
pub const EXPOSE_ABORT: &str = "expose.abort";
/// Exposure status: `Ready`, `InProgress`, `Readout` or `Error`.
pub const EXPOSE_STATUS: &str = "expose.status";
/// Incremented after each completed readout.
pub const FRAME_NUMBER: &str = "expose.frameno";

pub fn trigger(detector: Detector) -> String {
    format!("expose.trigger.{}", detector.point_name())
}

/// Detector status: `Ready` or `Error`.
pub fn detector_status(detector: Detector) -> String {
    format!("detector.{}.status", detector.point_name())
}

pub fn detector_reset(detector: Detector) -> String {
    format!("detector.{}.reset", detector.point_name())
}

pub const EXPMETER_MODE: &str = "expmeter.mode";
pub const EXPMETER_TIME: &str = "expmeter.time";

// =============================================================================
// Telescope / acquisition
// =============================================================================

pub fn target(field: &str) -> String {
    format!("target.{field}")
}

pub const GUIDER_MODE: &str = "guider.mode";
pub const AGITATOR: &str = "agitator.enable";

// =============================================================================
// Execution lock
// =============================================================================

pub const SCRIPT_NAME: &str = "script.name";
pub const SCRIPT_PID: &str = "script.pid";
pub const SCRIPT_HOST: &str = "script.host";
pub const SCRIPT_MSG: &str = "script.msg";
pub const SCRIPT_STOP: &str = "script.stop";

/// Readback point reporting the achieved state of `point`.
pub fn readback(point: &str) -> String {
    format!("{point}.rb")
}

/// True for readback points.
pub fn is_readback(point: &str) -> bool {
    point.ends_with(".rb")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_names() {
        assert_eq!(lamp_power(CalSource::LampA), "calbench.lamp.lampa.power");
        assert_eq!(shutter(Shutter::CalSci), "shutter.cal_sci");
        assert_eq!(trigger(Detector::CaHk), "expose.trigger.ca_hk");
        assert_eq!(readback(ND1), "calbench.nd1.rb");
        assert!(is_readback("calbench.nd1.rb"));
        assert!(!is_readback(ND1));
    }
}
