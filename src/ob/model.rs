//! Observing block data model.
//!
//! Field names follow the declarative OB format (`camelCase`). Unknown fields and
//! enum members outside the closed sets are rejected at load time.

use super::version::TemplateVersion;
use crate::error::{SequencerError, SequencerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// =============================================================================
// Closed enumerations
// =============================================================================

/// Observing block templates understood by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateName {
    Science,
    Calibration,
    Dark,
    SlewCal,
    Engineering,
}

impl TemplateName {
    pub const ALL: [TemplateName; 5] = [
        TemplateName::Science,
        TemplateName::Calibration,
        TemplateName::Dark,
        TemplateName::SlewCal,
        TemplateName::Engineering,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateName::Science => "science",
            TemplateName::Calibration => "calibration",
            TemplateName::Dark => "dark",
            TemplateName::SlewCal => "slew-cal",
            TemplateName::Engineering => "engineering",
        }
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calibration bench source positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalSource {
    Home,
    Dark,
    LampA,
    LampB,
    LampC,
    ThAr,
    UNe,
    WideFlat,
    BrdbandFiber,
    Etalon,
    #[serde(rename = "LFCFiber")]
    LfcFiber,
    SoCal,
}

impl CalSource {
    pub const ALL: [CalSource; 12] = [
        CalSource::Home,
        CalSource::Dark,
        CalSource::LampA,
        CalSource::LampB,
        CalSource::LampC,
        CalSource::ThAr,
        CalSource::UNe,
        CalSource::WideFlat,
        CalSource::BrdbandFiber,
        CalSource::Etalon,
        CalSource::LfcFiber,
        CalSource::SoCal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CalSource::Home => "Home",
            CalSource::Dark => "Dark",
            CalSource::LampA => "LampA",
            CalSource::LampB => "LampB",
            CalSource::LampC => "LampC",
            CalSource::ThAr => "ThAr",
            CalSource::UNe => "UNe",
            CalSource::WideFlat => "WideFlat",
            CalSource::BrdbandFiber => "BrdbandFiber",
            CalSource::Etalon => "Etalon",
            CalSource::LfcFiber => "LFCFiber",
            CalSource::SoCal => "SoCal",
        }
    }

    /// Lowercase name used in control point paths.
    pub fn point_name(self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    /// Sources with a lamp that must be powered and warmed up.
    pub fn is_lamp(self) -> bool {
        matches!(
            self,
            CalSource::LampA
                | CalSource::LampB
                | CalSource::LampC
                | CalSource::ThAr
                | CalSource::UNe
                | CalSource::WideFlat
                | CalSource::BrdbandFiber
        )
    }

    /// Sources that put light into the fibers.
    pub fn emits_light(self) -> bool {
        !matches!(self, CalSource::Home | CalSource::Dark)
    }
}

impl fmt::Display for CalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Neutral density filter wheel positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NdFilter {
    #[default]
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "0.1")]
    Nd01,
    #[serde(rename = "0.5")]
    Nd05,
    #[serde(rename = "0.8")]
    Nd08,
    #[serde(rename = "1.0")]
    Nd10,
    #[serde(rename = "4.0")]
    Nd40,
}

impl NdFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            NdFilter::Open => "OPEN",
            NdFilter::Nd01 => "0.1",
            NdFilter::Nd05 => "0.5",
            NdFilter::Nd08 => "0.8",
            NdFilter::Nd10 => "1.0",
            NdFilter::Nd40 => "4.0",
        }
    }
}

impl fmt::Display for NdFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat-field fiber aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FfFiber {
    #[default]
    Blank,
    #[serde(rename = "f/5")]
    F5,
    #[serde(rename = "f/4")]
    F4,
    #[serde(rename = "f/3.2")]
    F32,
}

impl FfFiber {
    pub fn as_str(self) -> &'static str {
        match self {
            FfFiber::Blank => "Blank",
            FfFiber::F5 => "f/5",
            FfFiber::F4 => "f/4",
            FfFiber::F32 => "f/3.2",
        }
    }
}

impl fmt::Display for FfFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector subsystems that can be triggered by an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Detector {
    Green,
    Red,
    CaHk,
    ExpMeter,
    Guide,
}

impl Detector {
    pub const ALL: [Detector; 5] = [
        Detector::Green,
        Detector::Red,
        Detector::CaHk,
        Detector::ExpMeter,
        Detector::Guide,
    ];

    pub fn point_name(self) -> &'static str {
        match self {
            Detector::Green => "green",
            Detector::Red => "red",
            Detector::CaHk => "ca_hk",
            Detector::ExpMeter => "expmeter",
            Detector::Guide => "guide",
        }
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.point_name())
    }
}

/// Guider mode during science steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuideMode {
    #[default]
    Off,
    Auto,
    Manual,
}

impl GuideMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GuideMode::Off => "off",
            GuideMode::Auto => "auto",
            GuideMode::Manual => "manual",
        }
    }
}

/// Exposure meter behaviour during a science exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpMeterMode {
    #[default]
    Off,
    Monitor,
    Control,
}

impl ExpMeterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpMeterMode::Off => "off",
            ExpMeterMode::Monitor => "monitor",
            ExpMeterMode::Control => "control",
        }
    }
}

// =============================================================================
// Step structures
// =============================================================================

/// Detector trigger flags.
///
/// When a step omits the mapping entirely the two science cameras are
/// triggered. A mapping that is present lists exactly the detectors to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TriggeredDetectors {
    #[serde(default)]
    pub green: bool,
    #[serde(default)]
    pub red: bool,
    #[serde(default)]
    pub ca_hk: bool,
    #[serde(default)]
    pub exp_meter: bool,
    #[serde(default)]
    pub guide: bool,
}

impl Default for TriggeredDetectors {
    fn default() -> Self {
        Self {
            green: true,
            red: true,
            ca_hk: false,
            exp_meter: false,
            guide: false,
        }
    }
}

impl TriggeredDetectors {
    pub fn is_enabled(&self, detector: Detector) -> bool {
        match detector {
            Detector::Green => self.green,
            Detector::Red => self.red,
            Detector::CaHk => self.ca_hk,
            Detector::ExpMeter => self.exp_meter,
            Detector::Guide => self.guide,
        }
    }

    pub fn enabled(&self) -> Vec<Detector> {
        Detector::ALL
            .into_iter()
            .filter(|d| self.is_enabled(*d))
            .collect()
    }

    pub fn any(&self) -> bool {
        Detector::ALL.into_iter().any(|d| self.is_enabled(d))
    }
}

/// Target of science observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Target {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaia_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_mass_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmag: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jmag: Option<f64>,
    /// Right ascension, sexagesimal hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ra: Option<String>,
    /// Declination, sexagesimal degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<f64>,
    /// Proper motion in RA, mas/yr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_ra: Option<f64>,
    /// Proper motion in Dec, mas/yr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_dec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallax: Option<f64>,
    /// Radial velocity, km/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rv: Option<f64>,
}

/// Exposures with every shutter closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DarkStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    pub exposure_count: u32,
    pub exposure_time: f64,
    #[serde(default)]
    pub triggered_detectors: TriggeredDetectors,
}

/// Exposures of one calibration source through the given filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CalibrationStep {
    pub source: CalSource,
    #[serde(default)]
    pub nd1: NdFilter,
    #[serde(default)]
    pub nd2: NdFilter,
    pub exposure_count: u32,
    pub exposure_time: f64,
    /// Route calibration light into the science fiber.
    #[serde(default = "default_true")]
    pub sci_select: bool,
    /// Route calibration light into the sky fiber.
    #[serde(default = "default_true")]
    pub sky_select: bool,
    #[serde(default)]
    pub simul_cal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ff_fiber: Option<FfFiber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default)]
    pub triggered_detectors: TriggeredDetectors,
}

/// On-sky exposures of the block's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScienceStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    pub exposure_count: u32,
    pub exposure_time: f64,
    #[serde(default)]
    pub exp_meter_mode: ExpMeterMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_meter_time: Option<f64>,
    #[serde(default)]
    pub simul_cal: bool,
    #[serde(default)]
    pub auto_nd: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nd1: Option<NdFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nd2: Option<NdFilter>,
    #[serde(default)]
    pub triggered_detectors: TriggeredDetectors,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Observing block
// =============================================================================

/// Declarative description of one instrument run.
///
/// Constructed once per run and read-only afterwards. See [`super::validate`]
/// for the checks applied before anything touches the instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObservingBlock {
    pub template_name: TemplateName,
    pub template_version: TemplateVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default)]
    pub dark_steps: Vec<DarkStep>,
    #[serde(default)]
    pub calibration_steps: Vec<CalibrationStep>,
    #[serde(default)]
    pub science_steps: Vec<ScienceStep>,
    /// Leave calibration lamps powered after the run.
    #[serde(default)]
    pub leave_source_on: bool,
    /// Run the fiber agitator during science exposures.
    #[serde(default)]
    pub use_agitator: bool,
    #[serde(default)]
    pub guide_mode: GuideMode,
    /// Source fed into the simultaneous calibration fiber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simul_cal_source: Option<CalSource>,
}

impl ObservingBlock {
    /// Parse an already decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> SequencerResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| SequencerError::validation(format!("invalid observing block: {e}")))
    }

    /// Parse JSON text.
    pub fn from_json_str(text: &str) -> SequencerResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SequencerError::validation(format!("invalid observing block: {e}")))
    }

    /// Parse YAML text.
    pub fn from_yaml_str(text: &str) -> SequencerResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| SequencerError::validation(format!("invalid observing block: {e}")))
    }

    /// Load an OB from disk. `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> SequencerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    pub fn to_value(&self) -> SequencerResult<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| SequencerError::validation(format!("cannot serialize observing block: {e}")))
    }

    /// Short human-readable identity used in lock messages, logs and alerts.
    pub fn identity(&self) -> String {
        let mut identity = format!("{} {}", self.template_name, self.template_version);
        if let Some(target) = &self.target {
            identity.push_str(&format!(" on {}", target.name));
        }
        identity.push_str(&format!(
            " ({} dark, {} calibration, {} science)",
            self.dark_steps.len(),
            self.calibration_steps.len(),
            self.science_steps.len()
        ));
        identity
    }

    pub fn step_count(&self) -> usize {
        self.dark_steps.len() + self.calibration_steps.len() + self.science_steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_calibration_ob() {
        let ob = ObservingBlock::from_value(json!({
            "templateName": "calibration",
            "templateVersion": "0.5",
            "calibrationSteps": [
                {"source": "LampA", "nd1": "0.1", "nd2": "0.1", "exposureCount": 2, "exposureTime": 5}
            ]
        }))
        .unwrap();

        assert_eq!(ob.template_name, TemplateName::Calibration);
        let step = &ob.calibration_steps[0];
        assert_eq!(step.source, CalSource::LampA);
        assert_eq!(step.nd1, NdFilter::Nd01);
        assert!(step.sci_select && step.sky_select);
        assert_eq!(step.triggered_detectors.enabled(), vec![Detector::Green, Detector::Red]);
    }

    #[test]
    fn test_explicit_detectors_replace_default() {
        let detectors: TriggeredDetectors = serde_json::from_value(json!({"caHk": true})).unwrap();
        assert_eq!(detectors.enabled(), vec![Detector::CaHk]);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = ObservingBlock::from_value(json!({
            "templateName": "dark",
            "templateVersion": "1.0",
            "darkSteps": [{"exposureCount": 1, "exposureTime": 60, "shutter": "open"}]
        }))
        .unwrap_err();
        assert!(matches!(err, SequencerError::Validation(_)));
    }

    #[test]
    fn test_unknown_template_and_source_rejected() {
        assert!(ObservingBlock::from_value(json!({
            "templateName": "flat",
            "templateVersion": "1.0"
        }))
        .is_err());
        assert!(ObservingBlock::from_value(json!({
            "templateName": "calibration",
            "templateVersion": "1.0",
            "calibrationSteps": [{"source": "LampZ", "exposureCount": 1, "exposureTime": 1}]
        }))
        .is_err());
    }

    #[test]
    fn test_point_names() {
        assert_eq!(CalSource::LfcFiber.point_name(), "lfcfiber");
        assert_eq!(Detector::CaHk.point_name(), "ca_hk");
        assert!(CalSource::ThAr.is_lamp());
        assert!(!CalSource::Etalon.is_lamp());
        assert!(!CalSource::Dark.emits_light());
    }

    #[test]
    fn test_yaml_loading() {
        let ob = ObservingBlock::from_yaml_str(
            r#"
templateName: slew-cal
templateVersion: "1.0"
calibrationSteps:
  - source: Etalon
    exposureCount: 1
    exposureTime: 30
    ffFiber: f/3.2
"#,
        )
        .unwrap();
        assert_eq!(ob.template_name, TemplateName::SlewCal);
        assert_eq!(ob.calibration_steps[0].ff_fiber, Some(FfFiber::F32));
    }

    #[test]
    fn test_identity() {
        let ob = ObservingBlock::from_value(json!({
            "templateName": "science",
            "templateVersion": "1.1",
            "target": {"name": "HD 10700"},
            "scienceSteps": [{"exposureCount": 1, "exposureTime": 300}]
        }))
        .unwrap();
        assert_eq!(
            ob.identity(),
            "science 1.1 on HD 10700 (0 dark, 0 calibration, 1 science)"
        );
    }
}
