//! Shared data contracts for volume records, partition manifests and normalization stats.

pub mod atomic;
pub mod manifest;
pub mod stats;
pub mod volume;

pub use atomic::write_atomic;
pub use manifest::{ManifestError, ManifestSchemaVersion, PartitionManifest};
pub use stats::{IntensityStats, StatsError};
pub use volume::{Orientation, Partition, Plane, ValidationError, VolumeRecord, VolumeSource};
