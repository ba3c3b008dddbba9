//! Core types, error definitions, and host-side volume containers.

use data_contracts::{ManifestError, Plane, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
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
    #[error("csv error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("record validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("volume {path} is malformed: {msg}")]
    Malformed { path: PathBuf, msg: String },
    #[error("no volume file found for sample {id} under {dir}")]
    MissingVolume { id: String, dir: PathBuf },
    #[error("cohort partition {partition} is empty")]
    EmptyCohort { partition: String },
    #[error("batch mixes shapes: {id} has {plane} stack {found:?}, expected {expected:?}")]
    ShapeMismatch {
        id: String,
        plane: &'static str,
        found: [usize; 3],
        expected: [usize; 3],
    },
    #[error("{0}")]
    Other(String),
}

/// Little-endian/big-endian marker for raw voxel files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoxelDType {
    F32,
}

/// Dense single-channel voxel grid stored in `[D, H, W]` row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub shape: [usize; 3],
    pub voxels: Vec<f32>,
}

impl Volume {
    pub fn new(shape: [usize; 3], voxels: Vec<f32>) -> DatasetResult<Self> {
        let expected = shape.iter().product::<usize>();
        if voxels.len() != expected {
            return Err(DatasetError::Other(format!(
                "volume shape {shape:?} needs {expected} voxels, got {}",
                voxels.len()
            )));
        }
        if shape.contains(&0) {
            return Err(DatasetError::Other(format!(
                "volume shape {shape:?} has an empty axis"
            )));
        }
        Ok(Self { shape, voxels })
    }

    pub fn filled(shape: [usize; 3], value: f32) -> Self {
        Self {
            shape,
            voxels: vec![value; shape.iter().product()],
        }
    }

    #[inline]
    pub fn index(&self, d: usize, h: usize, w: usize) -> usize {
        (d * self.shape[1] + h) * self.shape[2] + w
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Reslice into the stack of 2D slices seen from `plane`.
    ///
    /// - axial: slices along D, each `[H, W]` → `[D, H, W]`
    /// - coronal: slices along H, each `[D, W]` → `[H, D, W]`
    /// - sagittal: slices along W, each `[D, H]` → `[W, D, H]`
    pub fn plane_stack(&self, plane: Plane) -> Volume {
        let [d, h, w] = self.shape;
        match plane {
            Plane::Axial => self.clone(),
            Plane::Coronal => {
                let mut out = Vec::with_capacity(self.len());
                for hi in 0..h {
                    for di in 0..d {
                        let base = self.index(di, hi, 0);
                        out.extend_from_slice(&self.voxels[base..base + w]);
                    }
                }
                Volume {
                    shape: [h, d, w],
                    voxels: out,
                }
            }
            Plane::Sagittal => {
                let mut out = Vec::with_capacity(self.len());
                for wi in 0..w {
                    for di in 0..d {
                        for hi in 0..h {
                            out.push(self.voxels[self.index(di, hi, wi)]);
                        }
                    }
                }
                Volume {
                    shape: [w, d, h],
                    voxels: out,
                }
            }
        }
    }
}

/// Voxels of one sample, either as one dense volume or as three pre-sliced stacks.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeData {
    Dense(Volume),
    Planes {
        axial: Volume,
        sagittal: Volume,
        coronal: Volume,
    },
}

impl VolumeData {
    pub fn stack(&self, plane: Plane) -> Volume {
        match self {
            VolumeData::Dense(v) => v.plane_stack(plane),
            VolumeData::Planes {
                axial,
                sagittal,
                coronal,
            } => match plane {
                Plane::Axial => axial.clone(),
                Plane::Sagittal => sagittal.clone(),
                Plane::Coronal => coronal.clone(),
            },
        }
    }

    pub fn volumes_mut(&mut self) -> Vec<&mut Volume> {
        match self {
            VolumeData::Dense(v) => vec![v],
            VolumeData::Planes {
                axial,
                sagittal,
                coronal,
            } => vec![axial, sagittal, coronal],
        }
    }

    pub fn as_dense(&self) -> Option<&Volume> {
        match self {
            VolumeData::Dense(v) => Some(v),
            VolumeData::Planes { .. } => None,
        }
    }
}

/// A loaded, normalized sample ready for batching.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub data: VolumeData,
    pub label: Option<usize>,
}
