//! Winning-curve calibration: monotone fitters and the per-space loop that
//! drives them.

mod lightgbm;
mod pav;
mod schedule;

use std::path::PathBuf;
use std::sync::Arc;

use core_types::Calibrator;

pub use lightgbm::{LightGbmCalibrator, LightGbmParams};
pub use pav::{isotonic_fit, PoolAdjacentViolators};
pub use schedule::{calibrate_once, spawn_calibration_loop, CalibrationReport, CalibrationSettings};

/// LightGBM when an executable is configured or found on `PATH`, otherwise
/// the in-process isotonic fitter.
pub fn default_calibrator(lightgbm: Option<PathBuf>) -> Arc<dyn Calibrator> {
    let found = match lightgbm {
        Some(path) if path.is_file() => Some(LightGbmCalibrator::new(path)),
        Some(path) => {
            tracing::warn!(path = %path.display(), "configured lightgbm executable not found");
            None
        }
        None => LightGbmCalibrator::from_path(),
    };
    match found {
        Some(cal) => {
            tracing::info!(executable = %cal.executable().display(), "calibrating with lightgbm");
            Arc::new(cal)
        }
        None => {
            tracing::info!("calibrating with in-process isotonic regression");
            Arc::new(PoolAdjacentViolators)
        }
    }
}
