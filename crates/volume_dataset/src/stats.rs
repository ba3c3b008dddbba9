//! Intensity statistics over a partition, computed once at config generation.

use crate::loader::VolumeLoader;
use crate::types::{DatasetError, DatasetResult, VolumeData};
use data_contracts::{IntensityStats, VolumeRecord};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const HISTOGRAM_BINS: usize = 4096;

/// Which normalization the estimator resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatsKind {
    #[default]
    MeanStd,
    Percentile { low: f64, high: f64 },
}

/// Running mean/variance (Welford), mergeable with Chan's formula.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Welford {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl Welford {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn merge(&mut self, other: &Welford) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / total as f64;
        self.m2 += other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.count = total;
    }

    /// Population standard deviation.
    pub fn std(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }
}

#[derive(Debug, Clone)]
struct VolumePass {
    acc: Welford,
    min: f32,
    max: f32,
    non_finite: usize,
}

#[derive(Debug, Clone)]
pub struct IntensityStatsEstimator {
    kind: StatsKind,
    max_volumes: Option<usize>,
}

impl IntensityStatsEstimator {
    pub fn new(kind: StatsKind) -> Self {
        Self {
            kind,
            max_volumes: None,
        }
    }

    /// Only use the first `n` records, in manifest order.
    pub fn with_max_volumes(mut self, n: usize) -> Self {
        self.max_volumes = Some(n);
        self
    }

    pub fn estimate(
        &self,
        records: &[VolumeRecord],
        loader: &dyn VolumeLoader,
    ) -> DatasetResult<IntensityStats> {
        let take = self.max_volumes.unwrap_or(records.len()).min(records.len());
        let records = &records[..take];
        if records.is_empty() {
            return Err(DatasetError::EmptyCohort {
                partition: "train".into(),
            });
        }

        // Per-volume passes run in parallel; merging follows manifest order.
        let passes: Vec<VolumePass> = records
            .par_iter()
            .map(|record| {
                let data = loader.load(record)?;
                let pass = first_pass(&data);
                if pass.non_finite > 0 {
                    tracing::warn!(
                        id = %record.id,
                        count = pass.non_finite,
                        "ignoring non-finite voxels"
                    );
                }
                Ok(pass)
            })
            .collect::<DatasetResult<_>>()?;

        let mut total = Welford::default();
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for pass in &passes {
            total.merge(&pass.acc);
            min = min.min(pass.min);
            max = max.max(pass.max);
        }
        if total.count == 0 {
            return Err(DatasetError::EmptyCohort {
                partition: "train (no finite voxels)".into(),
            });
        }

        let stats = match self.kind {
            StatsKind::MeanStd => IntensityStats::MeanStd {
                mean: total.mean,
                std: total.std(),
            },
            StatsKind::Percentile { low, high } => {
                let histogram = records
                    .par_iter()
                    .map(|record| {
                        let data = loader.load(record)?;
                        Ok(histogram_pass(&data, min, max))
                    })
                    .collect::<DatasetResult<Vec<_>>>()?
                    .into_iter()
                    .fold(vec![0u64; HISTOGRAM_BINS], |mut acc, h| {
                        for (a, b) in acc.iter_mut().zip(h) {
                            *a += b;
                        }
                        acc
                    });
                IntensityStats::Percentile {
                    low_percentile: low,
                    high_percentile: high,
                    low: percentile_from_histogram(&histogram, min, max, low),
                    high: percentile_from_histogram(&histogram, min, max, high),
                }
            }
        };
        stats.validate().map_err(|e| DatasetError::Other(format!(
            "estimated stats are degenerate ({}): {e}",
            stats.describe()
        )))?;
        tracing::info!(volumes = records.len(), voxels = total.count, stats = %stats.describe(), "intensity stats estimated");
        Ok(stats)
    }
}

fn voxels_of(data: &VolumeData) -> Vec<&[f32]> {
    match data {
        VolumeData::Dense(v) => vec![&v.voxels],
        // Plane stacks reslice the same anatomy; the axial stack stands in for the volume.
        VolumeData::Planes { axial, .. } => vec![&axial.voxels],
    }
}

fn first_pass(data: &VolumeData) -> VolumePass {
    let mut pass = VolumePass {
        acc: Welford::default(),
        min: f32::INFINITY,
        max: f32::NEG_INFINITY,
        non_finite: 0,
    };
    for chunk in voxels_of(data) {
        for &v in chunk {
            if !v.is_finite() {
                pass.non_finite += 1;
                continue;
            }
            pass.acc.push(v as f64);
            pass.min = pass.min.min(v);
            pass.max = pass.max.max(v);
        }
    }
    pass
}

fn histogram_pass(data: &VolumeData, min: f32, max: f32) -> Vec<u64> {
    let mut bins = vec![0u64; HISTOGRAM_BINS];
    let span = (max - min) as f64;
    for chunk in voxels_of(data) {
        for &v in chunk {
            if !v.is_finite() {
                continue;
            }
            let idx = if span <= 0.0 {
                0
            } else {
                (((v - min) as f64 / span) * HISTOGRAM_BINS as f64) as usize
            };
            bins[idx.min(HISTOGRAM_BINS - 1)] += 1;
        }
    }
    bins
}

/// Value at percentile rank `q` (0..=100), linearly interpolated inside its bin.
fn percentile_from_histogram(bins: &[u64], min: f32, max: f32, q: f64) -> f64 {
    let total: u64 = bins.iter().sum();
    let min = min as f64;
    let max = max as f64;
    if total == 0 || max <= min {
        return min;
    }
    let width = (max - min) / bins.len() as f64;
    let target = (q / 100.0).clamp(0.0, 1.0) * total as f64;
    let mut cumulative = 0u64;
    for (i, &count) in bins.iter().enumerate() {
        let next = cumulative + count;
        if count > 0 && next as f64 >= target {
            let within = (target - cumulative as f64) / count as f64;
            return (min + (i as f64 + within.clamp(0.0, 1.0)) * width).clamp(min, max);
        }
        cumulative = next;
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_merge_matches_single_pass() {
        let values: Vec<f64> = (0..1000).map(|i| ((i * 37) % 101) as f64 * 0.25).collect();
        let mut single = Welford::default();
        values.iter().for_each(|v| single.push(*v));
        let mut merged = Welford::default();
        for chunk in values.chunks(97) {
            let mut part = Welford::default();
            chunk.iter().for_each(|v| part.push(*v));
            merged.merge(&part);
        }
        assert_eq!(merged.count, single.count);
        assert!((merged.mean - single.mean).abs() < 1e-9);
        assert!((merged.std() - single.std()).abs() < 1e-9);
    }

    #[test]
    fn histogram_percentiles_bracket_uniform_data() {
        let data = VolumeData::Dense(
            crate::types::Volume::new([10, 10, 10], (0..1000).map(|v| v as f32).collect()).unwrap(),
        );
        let bins = histogram_pass(&data, 0.0, 999.0);
        let p1 = percentile_from_histogram(&bins, 0.0, 999.0, 1.0);
        let p99 = percentile_from_histogram(&bins, 0.0, 999.0, 99.0);
        assert!((p1 - 10.0).abs() < 1.0, "p1={p1}");
        assert!((p99 - 989.0).abs() < 1.0, "p99={p99}");
    }

    #[test]
    fn non_finite_voxels_are_skipped() {
        let data = VolumeData::Dense(
            crate::types::Volume::new([1, 1, 4], vec![1.0, f32::NAN, 3.0, f32::INFINITY]).unwrap(),
        );
        let pass = first_pass(&data);
        assert_eq!(pass.non_finite, 2);
        assert_eq!(pass.acc.count, 2);
        assert_eq!(pass.acc.mean, 2.0);
    }
}
