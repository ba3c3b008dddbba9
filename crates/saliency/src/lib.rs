//! Post-hoc saliency maps for fine-tuned fusion classifiers.
//!
//! [`SaliencyRunner`] loads a classifier checkpoint once, normalizes every
//! sample with the checkpoint's intensity stats, and writes one importance map
//! per sample through an [`Attribution`] method.
#![recursion_limit = "256"]

pub mod attribution;
pub mod runner;
pub mod util;

pub use attribution::{Attribution, GradientSaliency};
pub use runner::{SaliencyRecord, SaliencyRunner, SaliencySummary, TargetClass};

use data_contracts::StatsError;
use std::path::PathBuf;
use thiserror::Error;
use training::CheckpointError;
use volume_dataset::DatasetError;

/// Backend the CLI attributes on: autodiff over the training backend.
pub type SaliencyBackend = burn::backend::Autodiff<training::TrainBackend>;

#[derive(Debug, Error)]
pub enum SaliencyError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("invalid intensity stats: {0}")]
    Stats(#[from] StatsError),
    #[error("checkpoint {0} carries no intensity stats")]
    MissingStats(PathBuf),
    #[error("sample {0} is stored as pre-sliced planes; saliency needs a dense volume")]
    UnsupportedInput(String),
    #[error("sample id {0:?} cannot name an output file")]
    InvalidSampleId(String),
    #[error("sample id {0} appears more than once")]
    DuplicateSample(String),
    #[error("target class {target} out of range for {classes} classes")]
    TargetOutOfRange { target: usize, classes: usize },
    #[error("map for {id} has shape {found:?}, input is {expected:?}")]
    ShapeMismatch {
        id: String,
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error("attribution failed: {0}")]
    Attribution(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SaliencyError {
    /// Failures tied to one sample; lenient runs skip these.
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            SaliencyError::Dataset(_)
                | SaliencyError::UnsupportedInput(_)
                | SaliencyError::TargetOutOfRange { .. }
                | SaliencyError::Attribution(_)
        )
    }
}
