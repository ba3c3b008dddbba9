//! Volume loading, stratified splitting, intensity statistics and batch
//! iteration for the fusion classifier.
//!
//! This crate provides utilities for:
//! - Loading volumes through the [`VolumeLoader`] seam (raw `f32` codec included)
//! - Deterministic class-stratified train/val/test splits
//! - Intensity statistics over a train partition
//! - Seeded host-side augmentation
//! - Ordered, per-epoch-shuffled batch iteration

pub mod aug;
pub mod batch;
pub mod cohort;
pub mod labels;
pub mod loader;
pub mod splits;
pub mod stats;
pub mod types;

pub use aug::{
    adjust_contrast, affine, flip, gaussian_smooth, mask_slices, permute_slices, reorder_slices, rot90,
    slice_grid_means, AffineParams, AugmentConfig, VolumeAugment,
};
pub use batch::{
    batch_labels, stack_plane, BatchConfig, BatchSource, PlaneBatch, RecordBatches, SampleBatches,
};
pub use cohort::Cohort;
pub use labels::LabelTable;
pub use loader::{read_raw_volume, write_raw_volume, RawVolumeHeader, RawVolumeLoader, VolumeLoader};
pub use splits::{SplitAssignment, SplitError, SplitRatio, StratifiedSplitter};
pub use stats::{IntensityStatsEstimator, StatsKind, Welford};
pub use types::*;
