use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{DeltaError, Result};

/// Sampling and averaging constants, fixed for the lifetime of a session.
///
/// The JSON keys match the upper-case names used by existing `config.json`
/// files, e.g. `{"DISTANCE_INTERVAL": 10, "DISTANCE_UPPER_BOUND": 2, ...}`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeltaConfig {
    /// How often distances are saved. Lower is finer but noisier and larger.
    pub distance_interval: f64,
    /// How far past a multiple of the interval a reading may be and still count.
    pub distance_upper_bound: f64,
    /// Common points averaged into one delta.
    pub points_per_average: usize,
    /// Delta averages used for the real-time catch forecast.
    pub averages_per_to_catch: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            distance_interval: 10.0,
            distance_upper_bound: 2.0,
            points_per_average: 5,
            averages_per_to_catch: 5,
        }
    }
}

impl DeltaConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        let cfg: DeltaConfig = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.distance_interval.is_finite() || self.distance_interval <= 0.0 {
            return Err(DeltaError::InvalidArgument(format!(
                "DISTANCE_INTERVAL must be positive, got {}",
                self.distance_interval
            )));
        }
        // A bound at or past the interval is allowed and admits every sample.
        if !self.distance_upper_bound.is_finite() || self.distance_upper_bound < 0.0 {
            return Err(DeltaError::InvalidArgument(format!(
                "DISTANCE_UPPER_BOUND must be a non-negative number, got {}",
                self.distance_upper_bound
            )));
        }
        if self.points_per_average == 0 || self.averages_per_to_catch == 0 {
            return Err(DeltaError::InvalidArgument(
                "POINTS_PER_AVERAGE and AVERAGES_PER_TO_CATCH must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of buckets common to every competitor kept by retention.
    pub fn retention_target(&self) -> usize {
        self.points_per_average * self.averages_per_to_catch
    }
}
