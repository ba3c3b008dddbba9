use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// One of the three orthogonal slice-stack views of a volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Plane {
    Axial,
    Sagittal,
    Coronal,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Axial, Plane::Sagittal, Plane::Coronal];

    pub fn index(self) -> usize {
        match self {
            Plane::Axial => 0,
            Plane::Sagittal => 1,
            Plane::Coronal => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plane::Axial => "axial",
            Plane::Sagittal => "sagittal",
            Plane::Coronal => "coronal",
        }
    }
}

/// Axis code describing voxel orientation, e.g. `SAR`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Orientation(pub String);

impl Orientation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let code = self.0.as_bytes();
        if code.len() != 3 {
            return Err(ValidationError::InvalidOrientation(self.0.clone()));
        }
        let mut axes = [false; 3];
        for c in code {
            let axis = match c.to_ascii_uppercase() {
                b'L' | b'R' => 0,
                b'A' | b'P' => 1,
                b'S' | b'I' => 2,
                _ => return Err(ValidationError::InvalidOrientation(self.0.clone())),
            };
            if axes[axis] {
                return Err(ValidationError::InvalidOrientation(self.0.clone()));
            }
            axes[axis] = true;
        }
        Ok(())
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a record's voxels live on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeSource {
    /// A single 3D tensor `[D, H, W]`.
    Volume { path: PathBuf },
    /// Three pre-sliced stacks, one per plane.
    Planes {
        axial: PathBuf,
        sagittal: PathBuf,
        coronal: PathBuf,
    },
}

impl VolumeSource {
    pub fn paths(&self) -> Vec<&PathBuf> {
        match self {
            VolumeSource::Volume { path } => vec![path],
            VolumeSource::Planes {
                axial,
                sagittal,
                coronal,
            } => vec![axial, sagittal, coronal],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    pub id: String,
    pub source: VolumeSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("record id is empty")]
    EmptyId,
    #[error("record {0}: empty volume path")]
    EmptyPath(String),
    #[error("orientation code {0:?} is not a permutation of L/R, A/P, S/I")]
    InvalidOrientation(String),
    #[error("record {id}: label {label} out of range for {num_classes} classes")]
    LabelOutOfRange {
        id: String,
        label: usize,
        num_classes: usize,
    },
    #[error("duplicate record id {0}")]
    DuplicateId(String),
    #[error("record {id} listed in both {first} and {second}")]
    Overlap {
        id: String,
        first: Partition,
        second: Partition,
    },
}

impl VolumeRecord {
    pub fn from_volume(id: impl Into<String>, path: impl Into<PathBuf>, label: Option<usize>) -> Self {
        Self {
            id: id.into(),
            source: VolumeSource::Volume { path: path.into() },
            label,
            orientation: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self
            .source
            .paths()
            .iter()
            .any(|p| p.as_os_str().is_empty())
        {
            return Err(ValidationError::EmptyPath(self.id.clone()));
        }
        if let Some(orientation) = &self.orientation {
            orientation.validate()?;
        }
        Ok(())
    }

    pub fn validate_label(&self, num_classes: usize) -> Result<(), ValidationError> {
        match self.label {
            Some(label) if label >= num_classes => Err(ValidationError::LabelOutOfRange {
                id: self.id.clone(),
                label,
                num_classes,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Val,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Val, Partition::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Val => "val",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
