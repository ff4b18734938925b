//! Numeric bounds shared by observing block validation and action preconditions.

use super::NdFilter;
use crate::error::{SequencerError, SequencerResult};

/// Minimum exposures per step.
pub const MIN_EXPOSURE_COUNT: u32 = 1;
/// Maximum exposures per step.
pub const MAX_EXPOSURE_COUNT: u32 = 1000;
/// Longest single exposure, in seconds.
pub const MAX_EXPOSURE_TIME_S: f64 = 3600.0;
/// Longest exposure meter integration, in seconds.
pub const MAX_EXPMETER_TIME_S: f64 = 600.0;

pub fn validate_exposure_count(field: &str, count: u32) -> SequencerResult<()> {
    if !(MIN_EXPOSURE_COUNT..=MAX_EXPOSURE_COUNT).contains(&count) {
        return Err(SequencerError::validation(format!(
            "{field}: exposureCount {count} outside {MIN_EXPOSURE_COUNT}..={MAX_EXPOSURE_COUNT}"
        )));
    }
    Ok(())
}

pub fn validate_exposure_time(field: &str, seconds: f64) -> SequencerResult<()> {
    if !seconds.is_finite() || !(0.0..=MAX_EXPOSURE_TIME_S).contains(&seconds) {
        return Err(SequencerError::validation(format!(
            "{field}: exposureTime {seconds} outside 0..={MAX_EXPOSURE_TIME_S} s"
        )));
    }
    Ok(())
}

/// Exposure meter integration time. Must be strictly positive.
pub fn validate_expmeter_time(field: &str, seconds: f64) -> SequencerResult<()> {
    if !seconds.is_finite() || seconds <= 0.0 || seconds > MAX_EXPMETER_TIME_S {
        return Err(SequencerError::validation(format!(
            "{field}: expMeterTime {seconds} outside (0, {MAX_EXPMETER_TIME_S}] s"
        )));
    }
    Ok(())
}

/// Neutral density used for simultaneous calibration when `autoNd` is set.
///
/// | Gmag     | ND  |
/// |----------|-----|
/// | < 8      | 0.1 |
/// | 8 .. 11  | 0.5 |
/// | 11 .. 14 | 1.0 |
/// | >= 14    | 4.0 |
pub fn auto_nd_for_magnitude(gmag: f64) -> NdFilter {
    if gmag < 8.0 {
        NdFilter::Nd01
    } else if gmag < 11.0 {
        NdFilter::Nd05
    } else if gmag < 14.0 {
        NdFilter::Nd10
    } else {
        NdFilter::Nd40
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposure_count_bounds() {
        assert!(validate_exposure_count("step", 0).is_err());
        assert!(validate_exposure_count("step", 1).is_ok());
        assert!(validate_exposure_count("step", 1000).is_ok());
        assert!(validate_exposure_count("step", 1001).is_err());
    }

    #[test]
    fn test_exposure_time_bounds() {
        assert!(validate_exposure_time("step", 0.0).is_ok());
        assert!(validate_exposure_time("step", 3600.0).is_ok());
        assert!(validate_exposure_time("step", -1.0).is_err());
        assert!(validate_exposure_time("step", f64::NAN).is_err());
        assert!(validate_exposure_time("step", 3600.5).is_err());
    }

    #[test]
    fn test_expmeter_time_must_be_positive() {
        assert!(validate_expmeter_time("step", 0.0).is_err());
        assert!(validate_expmeter_time("step", 1.5).is_ok());
    }

    #[test]
    fn test_auto_nd_table() {
        assert_eq!(auto_nd_for_magnitude(5.0), NdFilter::Nd01);
        assert_eq!(auto_nd_for_magnitude(8.0), NdFilter::Nd05);
        assert_eq!(auto_nd_for_magnitude(12.3), NdFilter::Nd10);
        assert_eq!(auto_nd_for_magnitude(16.0), NdFilter::Nd40);
    }
}
