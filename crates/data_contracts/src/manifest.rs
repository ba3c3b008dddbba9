use crate::atomic::write_atomic;
use crate::volume::{Partition, ValidationError, VolumeRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ManifestSchemaVersion {
    V1,
}

/// The records of one partition, as listed by a `data_list` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub schema_version: ManifestSchemaVersion,
    pub partition: Partition,
    /// Seed used by the split that produced this manifest, if any.
    #[serde(default)]
    pub seed: Option<u64>,
    pub records: Vec<VolumeRecord>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest {path} is invalid: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },
}

impl PartitionManifest {
    pub fn new(partition: Partition, seed: Option<u64>, records: Vec<VolumeRecord>) -> Self {
        Self {
            schema_version: ManifestSchemaVersion::V1,
            partition,
            seed,
            records,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for record in &self.records {
            record.validate()?;
            if !seen.insert(record.id.as_str()) {
                return Err(ValidationError::DuplicateId(record.id.clone()));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read(path).map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let manifest: Self = serde_json::from_slice(&raw).map_err(|e| ManifestError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        manifest.validate().map_err(|e| ManifestError::Invalid {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let data = serde_json::to_vec_pretty(self).map_err(|e| ManifestError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        write_atomic(path, &data).map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
