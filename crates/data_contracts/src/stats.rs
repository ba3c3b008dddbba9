use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalization statistics computed once over a cohort's train partition.
///
/// The same value travels with the run config and every checkpoint of the run,
/// so training, validation and saliency all normalize identically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntensityStats {
    MeanStd {
        mean: f64,
        std: f64,
    },
    /// Clip to the intensities at the given percentile ranks, then rescale to `[0, 1]`.
    Percentile {
        low_percentile: f64,
        high_percentile: f64,
        low: f64,
        high: f64,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("std must be finite and positive (got {0})")]
    InvalidStd(f64),
    #[error("mean must be finite (got {0})")]
    InvalidMean(f64),
    #[error("percentile ranks must satisfy 0 <= low < high <= 100 (got {low}, {high})")]
    InvalidRanks { low: f64, high: f64 },
    #[error("percentile values must be finite with low <= high (got {low}, {high})")]
    InvalidRange { low: f64, high: f64 },
}

impl IntensityStats {
    pub fn validate(&self) -> Result<(), StatsError> {
        match *self {
            IntensityStats::MeanStd { mean, std } => {
                if !mean.is_finite() {
                    return Err(StatsError::InvalidMean(mean));
                }
                if !std.is_finite() || std <= 0.0 {
                    return Err(StatsError::InvalidStd(std));
                }
            }
            IntensityStats::Percentile {
                low_percentile,
                high_percentile,
                low,
                high,
            } => {
                if !(0.0..=100.0).contains(&low_percentile)
                    || !(0.0..=100.0).contains(&high_percentile)
                    || low_percentile >= high_percentile
                {
                    return Err(StatsError::InvalidRanks {
                        low: low_percentile,
                        high: high_percentile,
                    });
                }
                if !low.is_finite() || !high.is_finite() || low > high {
                    return Err(StatsError::InvalidRange { low, high });
                }
            }
        }
        Ok(())
    }

    /// Normalize voxels in place.
    pub fn normalize(&self, voxels: &mut [f32]) {
        match *self {
            IntensityStats::MeanStd { mean, std } => {
                let mean = mean as f32;
                let inv = 1.0 / (std as f32).max(f32::EPSILON);
                for v in voxels.iter_mut() {
                    *v = (*v - mean) * inv;
                }
            }
            IntensityStats::Percentile { low, high, .. } => {
                let low = low as f32;
                let high = high as f32;
                let span = (high - low).max(f32::EPSILON);
                for v in voxels.iter_mut() {
                    *v = (v.clamp(low, high) - low) / span;
                }
            }
        }
    }

    pub fn describe(&self) -> String {
        match *self {
            IntensityStats::MeanStd { mean, std } => format!("mean={mean:.4} std={std:.4}"),
            IntensityStats::Percentile {
                low_percentile,
                high_percentile,
                low,
                high,
            } => format!("p{low_percentile}={low:.4} p{high_percentile}={high:.4}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_std_normalization_matches_subtract_divide() {
        let stats = IntensityStats::MeanStd { mean: 2.0, std: 4.0 };
        let mut v = vec![2.0, 6.0, -2.0];
        stats.normalize(&mut v);
        assert_eq!(v, vec![0.0, 1.0, -1.0]);
    }

    #[test]
    fn percentile_normalization_clips_and_rescales() {
        let stats = IntensityStats::Percentile {
            low_percentile: 1.0,
            high_percentile: 99.0,
            low: 10.0,
            high: 20.0,
        };
        let mut v = vec![0.0, 15.0, 30.0];
        stats.normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn rejects_degenerate_std() {
        let stats = IntensityStats::MeanStd { mean: 0.0, std: 0.0 };
        assert_eq!(stats.validate(), Err(StatsError::InvalidStd(0.0)));
    }
}
