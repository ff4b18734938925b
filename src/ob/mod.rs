//! Observing block model.
//!
//! An observing block (OB) is the declarative description of one instrument
//! run: a template name and version, an optional target, and ordered lists of
//! dark, calibration and science steps.
//!
//! # Architecture
//!
//! - [`model`] - Serde data model with closed enumerations
//! - [`version`] - Template version parsing and lower-bound comparison
//! - [`limits`] - Numeric bounds shared with action preconditions
//! - [`validate`] - Validation and expansion into an [`ExecutionPlan`]
//!
//! # Example
//!
//! ```
//! use ob_sequencer::ob::{default_minimum_versions, ObservingBlock};
//!
//! let ob = ObservingBlock::from_json_str(r#"{
//!     "templateName": "calibration",
//!     "templateVersion": "0.5",
//!     "calibrationSteps": [
//!         {"source": "LampA", "nd1": "0.1", "nd2": "0.1", "exposureCount": 2, "exposureTime": 5}
//!     ]
//! }"#).unwrap();
//!
//! let plan = ob.validate(&default_minimum_versions()).unwrap();
//! assert_eq!(plan.step_count(), 1);
//! ```

pub mod limits;
pub mod model;
pub mod validate;
pub mod version;

pub use model::{
    CalSource, CalibrationStep, DarkStep, Detector, ExpMeterMode, FfFiber, GuideMode, NdFilter,
    ObservingBlock, ScienceStep, Target, TemplateName, TriggeredDetectors,
};
pub use validate::{
    default_minimum_versions, Acquisition, ExecutionPlan, MinimumVersions, PlannedStep,
    ResolvedScienceStep, StepSpec,
};
pub use version::TemplateVersion;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Step groups, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepGroup {
    Dark,
    Calibration,
    Science,
}

impl StepGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            StepGroup::Dark => "dark",
            StepGroup::Calibration => "calibration",
            StepGroup::Science => "science",
        }
    }
}

/// Position of a step within its observing block, e.g. `calibration[0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRef {
    pub group: StepGroup,
    /// Zero-based position within the group.
    pub index: usize,
}

impl StepRef {
    /// Reference to step `index` of `group`.
    pub fn new(group: StepGroup, index: usize) -> Self {
        Self { group, index }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.group.as_str(), self.index)
    }
}
