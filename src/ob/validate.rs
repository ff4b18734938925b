//! Observing block validation and expansion.
//!
//! [`ObservingBlock::validate`] turns a loaded block into an [`ExecutionPlan`]:
//! dark steps, calibration steps, zero or one acquisition phase and science
//! steps, each tagged with its [`StepRef`]. Validation is pure. It never touches
//! the device bus and never takes the execution lock.

use super::limits;
use super::model::{
    CalSource, CalibrationStep, DarkStep, ExpMeterMode, GuideMode, NdFilter, ObservingBlock,
    ScienceStep, Target, TemplateName, TriggeredDetectors,
};
use super::version::TemplateVersion;
use super::{StepGroup, StepRef};
use crate::error::{SequencerError, SequencerResult};
use std::collections::HashMap;

/// Minimum compatible template version per template.
pub type MinimumVersions = HashMap<TemplateName, TemplateVersion>;

/// One step of the plan with its position in the block.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    /// Group and index within the block.
    pub step_ref: StepRef,
    /// What the step does.
    pub spec: StepSpec,
}

/// Step content by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StepSpec {
    /// Closed-shutter exposures.
    Dark(DarkStep),
    /// Exposures of a calibration source.
    Calibration(CalibrationStep),
    /// On-sky exposures.
    Science(ResolvedScienceStep),
}

impl StepSpec {
    /// Number of exposures the step takes.
    pub fn exposure_count(&self) -> u32 {
        match self {
            StepSpec::Dark(s) => s.exposure_count,
            StepSpec::Calibration(s) => s.exposure_count,
            StepSpec::Science(s) => s.step.exposure_count,
        }
    }

    /// Seconds per exposure.
    pub fn exposure_time(&self) -> f64 {
        match self {
            StepSpec::Dark(s) => s.exposure_time,
            StepSpec::Calibration(s) => s.exposure_time,
            StepSpec::Science(s) => s.step.exposure_time,
        }
    }

    pub fn triggered_detectors(&self) -> TriggeredDetectors {
        match self {
            StepSpec::Dark(s) => s.triggered_detectors,
            StepSpec::Calibration(s) => s.triggered_detectors,
            StepSpec::Science(s) => s.step.triggered_detectors,
        }
    }
}

/// A science step with its neutral density selection resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScienceStep {
    /// The step as written in the block.
    pub step: ScienceStep,
    /// Filters for the simultaneous calibration path, when `simulCal` is set.
    pub nd: Option<(NdFilter, NdFilter)>,
}

/// Telescope setup run once before the science steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub target: Target,
    pub guide_mode: GuideMode,
    pub use_agitator: bool,
}

/// Validated, expanded observing block.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// See [`ObservingBlock::identity`].
    pub identity: String,
    pub template: TemplateName,
    pub dark_steps: Vec<PlannedStep>,
    pub calibration_steps: Vec<PlannedStep>,
    pub acquisition: Option<Acquisition>,
    pub science_steps: Vec<PlannedStep>,
    /// Skip switching lamps off during cleanup.
    pub leave_source_on: bool,
    /// Lamp feeding the simultaneous calibration fiber.
    pub simul_cal_source: Option<CalSource>,
}

impl ExecutionPlan {
    /// All steps in execution order: darks, calibrations, science.
    pub fn steps(&self) -> impl Iterator<Item = &PlannedStep> {
        self.dark_steps
            .iter()
            .chain(self.calibration_steps.iter())
            .chain(self.science_steps.iter())
    }

    /// Total number of steps.
    pub fn step_count(&self) -> usize {
        self.dark_steps.len() + self.calibration_steps.len() + self.science_steps.len()
    }

    /// Whether the calibration bench needs configuring.
    pub fn uses_calibration_bench(&self) -> bool {
        !self.dark_steps.is_empty() || !self.calibration_steps.is_empty()
    }

    /// Lamps used by the calibration steps (and the simultaneous calibration
    /// source), deduplicated in first-use order.
    pub fn lamps(&self) -> Vec<CalSource> {
        let mut lamps = Vec::new();
        let step_sources = self.calibration_steps.iter().filter_map(|s| match &s.spec {
            StepSpec::Calibration(c) => Some(c.source),
            _ => None,
        });
        let simul = self
            .science_steps
            .iter()
            .any(|s| matches!(&s.spec, StepSpec::Science(r) if r.step.simul_cal))
            .then_some(self.simul_cal_source)
            .flatten();

        for source in step_sources.chain(simul) {
            if source.is_lamp() && !lamps.contains(&source) {
                lamps.push(source);
            }
        }
        lamps
    }
}

/// Built-in minimum compatible versions.
pub fn default_minimum_versions() -> MinimumVersions {
    [
        (TemplateName::Science, "0.5"),
        (TemplateName::Calibration, "0.3"),
        (TemplateName::Dark, "0.3"),
        (TemplateName::SlewCal, "0.5"),
        (TemplateName::Engineering, "0.1"),
    ]
    .into_iter()
    .filter_map(|(name, version)| TemplateVersion::parse(version).ok().map(|v| (name, v)))
    .collect()
}

impl ObservingBlock {
    /// Validate the block and expand it into an [`ExecutionPlan`].
    ///
    /// The template version is checked first, so an incompatible block is
    /// rejected before any field-level validation. Templates without a
    /// configured minimum have no lower bound.
    pub fn validate(&self, minimums: &MinimumVersions) -> SequencerResult<ExecutionPlan> {
        if let Some(minimum) = minimums.get(&self.template_name) {
            if self.template_version < *minimum {
                return Err(SequencerError::validation(format!(
                    "templateVersion {} for '{}' is below the minimum compatible version {}",
                    self.template_version, self.template_name, minimum
                )));
            }
        }

        if self.step_count() == 0 {
            return Err(SequencerError::validation(
                "observing block contains no dark, calibration or science steps",
            ));
        }

        let dark_steps = self
            .dark_steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let step_ref = StepRef::new(StepGroup::Dark, i);
                validate_dark(step_ref, step)?;
                Ok(PlannedStep {
                    step_ref,
                    spec: StepSpec::Dark(step.clone()),
                })
            })
            .collect::<SequencerResult<Vec<_>>>()?;

        let calibration_steps = self
            .calibration_steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let step_ref = StepRef::new(StepGroup::Calibration, i);
                validate_calibration(step_ref, step, self.simul_cal_source)?;
                Ok(PlannedStep {
                    step_ref,
                    spec: StepSpec::Calibration(step.clone()),
                })
            })
            .collect::<SequencerResult<Vec<_>>>()?;

        let acquisition = if self.science_steps.is_empty() {
            None
        } else {
            let target = self
                .target
                .as_ref()
                .filter(|t| !t.name.trim().is_empty())
                .ok_or_else(|| {
                    SequencerError::validation("science steps require a target with a name")
                })?;
            Some(Acquisition {
                target: target.clone(),
                guide_mode: self.guide_mode,
                use_agitator: self.use_agitator,
            })
        };

        let science_steps = self
            .science_steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let step_ref = StepRef::new(StepGroup::Science, i);
                let resolved = resolve_science(step_ref, step, self)?;
                Ok(PlannedStep {
                    step_ref,
                    spec: StepSpec::Science(resolved),
                })
            })
            .collect::<SequencerResult<Vec<_>>>()?;

        Ok(ExecutionPlan {
            identity: self.identity(),
            template: self.template_name,
            dark_steps,
            calibration_steps,
            acquisition,
            science_steps,
            leave_source_on: self.leave_source_on,
            simul_cal_source: self.simul_cal_source,
        })
    }
}

fn validate_exposure(
    step_ref: StepRef,
    count: u32,
    time: f64,
    detectors: &TriggeredDetectors,
) -> SequencerResult<()> {
    let field = step_ref.to_string();
    limits::validate_exposure_count(&field, count)?;
    limits::validate_exposure_time(&field, time)?;
    if !detectors.any() {
        return Err(SequencerError::validation(format!(
            "{field}: triggeredDetectors must enable at least one detector"
        )));
    }
    Ok(())
}

fn validate_object(step_ref: StepRef, object: &Option<String>) -> SequencerResult<()> {
    match object {
        Some(label) if label.trim().is_empty() => Err(SequencerError::validation(format!(
            "{step_ref}: object must not be blank"
        ))),
        _ => Ok(()),
    }
}

fn validate_dark(step_ref: StepRef, step: &DarkStep) -> SequencerResult<()> {
    validate_exposure(
        step_ref,
        step.exposure_count,
        step.exposure_time,
        &step.triggered_detectors,
    )?;
    validate_object(step_ref, &step.object)
}

fn validate_calibration(
    step_ref: StepRef,
    step: &CalibrationStep,
    simul_cal_source: Option<CalSource>,
) -> SequencerResult<()> {
    validate_exposure(
        step_ref,
        step.exposure_count,
        step.exposure_time,
        &step.triggered_detectors,
    )?;
    validate_object(step_ref, &step.object)?;

    if step.source == CalSource::Home {
        return Err(SequencerError::validation(format!(
            "{step_ref}: 'Home' is a parking position, not a calibration source"
        )));
    }
    if step.simul_cal && simul_cal_source.is_none() {
        return Err(SequencerError::validation(format!(
            "{step_ref}: simulCal requires simulCalSource"
        )));
    }
    if step.source.emits_light() && !(step.sci_select || step.sky_select || step.simul_cal) {
        return Err(SequencerError::validation(format!(
            "{step_ref}: source {} is not routed to any fiber",
            step.source
        )));
    }
    Ok(())
}

fn resolve_science(
    step_ref: StepRef,
    step: &ScienceStep,
    ob: &ObservingBlock,
) -> SequencerResult<ResolvedScienceStep> {
    validate_exposure(
        step_ref,
        step.exposure_count,
        step.exposure_time,
        &step.triggered_detectors,
    )?;
    validate_object(step_ref, &step.object)?;

    if step.exp_meter_mode != ExpMeterMode::Off {
        let time = step.exp_meter_time.ok_or_else(|| {
            SequencerError::validation(format!(
                "{step_ref}: expMeterTime is required when expMeterMode is {}",
                step.exp_meter_mode.as_str()
            ))
        })?;
        limits::validate_expmeter_time(&step_ref.to_string(), time)?;
    }

    let manual = step.nd1.is_some() || step.nd2.is_some();
    if step.auto_nd && manual {
        return Err(SequencerError::validation(format!(
            "{step_ref}: autoNd and manual nd1/nd2 are mutually exclusive"
        )));
    }
    if (step.auto_nd || manual) && !step.simul_cal {
        return Err(SequencerError::validation(format!(
            "{step_ref}: neutral density selection requires simulCal"
        )));
    }

    let nd = if !step.simul_cal {
        None
    } else {
        if ob.simul_cal_source.is_none() {
            return Err(SequencerError::validation(format!(
                "{step_ref}: simulCal requires simulCalSource"
            )));
        }
        if step.auto_nd {
            let gmag = ob.target.as_ref().and_then(|t| t.gmag).ok_or_else(|| {
                SequencerError::validation(format!("{step_ref}: autoNd requires target gmag"))
            })?;
            Some((limits::auto_nd_for_magnitude(gmag), NdFilter::Open))
        } else {
            Some((step.nd1.unwrap_or_default(), step.nd2.unwrap_or_default()))
        }
    };

    Ok(ResolvedScienceStep {
        step: step.clone(),
        nd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ob(value: serde_json::Value) -> ObservingBlock {
        ObservingBlock::from_value(value).unwrap()
    }

    fn scenario_a() -> ObservingBlock {
        ob(json!({
            "templateName": "calibration",
            "templateVersion": "0.5",
            "calibrationSteps": [
                {"source": "LampA", "nd1": "0.1", "nd2": "0.1", "exposureCount": 2, "exposureTime": 5}
            ]
        }))
    }

    #[test]
    fn test_scenario_a_validates() {
        let plan = scenario_a().validate(&default_minimum_versions()).unwrap();
        assert_eq!(plan.step_count(), 1);
        assert!(plan.acquisition.is_none());
        assert_eq!(plan.lamps(), vec![CalSource::LampA]);
        assert_eq!(
            plan.calibration_steps[0].step_ref,
            StepRef::new(StepGroup::Calibration, 0)
        );
    }

    #[test]
    fn test_version_below_minimum_rejected() {
        let mut minimums = default_minimum_versions();
        minimums.insert(TemplateName::Calibration, "0.6".parse().unwrap());
        let err = scenario_a().validate(&minimums).unwrap_err();
        assert!(matches!(err, SequencerError::Validation(ref m) if m.contains("minimum")));
    }

    #[test]
    fn test_newer_major_version_accepted() {
        let mut block = scenario_a();
        block.template_version = "7.0".parse().unwrap();
        assert!(block.validate(&default_minimum_versions()).is_ok());
    }

    #[test]
    fn test_empty_block_rejected() {
        let block = ob(json!({"templateName": "dark", "templateVersion": "1.0"}));
        assert!(block.validate(&default_minimum_versions()).is_err());
    }

    #[test]
    fn test_science_requires_target() {
        let block = ob(json!({
            "templateName": "science",
            "templateVersion": "1.0",
            "scienceSteps": [{"exposureCount": 1, "exposureTime": 60}]
        }));
        assert!(block.validate(&default_minimum_versions()).is_err());
    }

    #[test]
    fn test_acquisition_present_iff_science_steps() {
        let block = ob(json!({
            "templateName": "science",
            "templateVersion": "1.0",
            "target": {"name": "HD 10700", "gmag": 3.5},
            "guideMode": "auto",
            "useAgitator": true,
            "simulCalSource": "Etalon",
            "scienceSteps": [
                {"exposureCount": 3, "exposureTime": 60, "simulCal": true, "autoNd": true}
            ]
        }));
        let plan = block.validate(&default_minimum_versions()).unwrap();
        let acquisition = plan.acquisition.as_ref().unwrap();
        assert_eq!(acquisition.guide_mode, GuideMode::Auto);
        assert!(acquisition.use_agitator);

        match &plan.science_steps[0].spec {
            StepSpec::Science(resolved) => {
                assert_eq!(resolved.nd, Some((NdFilter::Nd01, NdFilter::Open)));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_auto_and_manual_nd_exclusive() {
        let block = ob(json!({
            "templateName": "science",
            "templateVersion": "1.0",
            "target": {"name": "HD 10700", "gmag": 3.5},
            "simulCalSource": "Etalon",
            "scienceSteps": [
                {"exposureCount": 1, "exposureTime": 60, "simulCal": true, "autoNd": true, "nd1": "0.5"}
            ]
        }));
        assert!(block.validate(&default_minimum_versions()).is_err());
    }

    #[test]
    fn test_expmeter_time_required_when_on() {
        let block = ob(json!({
            "templateName": "science",
            "templateVersion": "1.0",
            "target": {"name": "HD 10700"},
            "scienceSteps": [{"exposureCount": 1, "exposureTime": 60, "expMeterMode": "monitor"}]
        }));
        assert!(block.validate(&default_minimum_versions()).is_err());
    }

    #[test]
    fn test_no_detectors_rejected() {
        let block = ob(json!({
            "templateName": "dark",
            "templateVersion": "1.0",
            "darkSteps": [{"exposureCount": 1, "exposureTime": 60, "triggeredDetectors": {}}]
        }));
        let err = block.validate(&default_minimum_versions()).unwrap_err();
        assert!(err.to_string().contains("dark[0]"));
    }

    #[test]
    fn test_unrouted_source_rejected() {
        let block = ob(json!({
            "templateName": "calibration",
            "templateVersion": "1.0",
            "calibrationSteps": [{
                "source": "ThAr", "exposureCount": 1, "exposureTime": 10,
                "sciSelect": false, "skySelect": false
            }]
        }));
        assert!(block.validate(&default_minimum_versions()).is_err());
    }
}
