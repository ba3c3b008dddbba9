//! Checkpoint → per-sample importance maps on disk.

use crate::attribution::Attribution;
use crate::SaliencyError;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use data_contracts::{write_atomic, IntensityStats, VolumeRecord};
use models::{FusionClassifier, PlaneStacks};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use training::{load_classifier, predict};
use volume_dataset::{Endianness, Volume, VolumeData, VolumeLoader, VoxelDType};

/// Which class the attribution explains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetClass {
    #[default]
    Predicted,
    /// The record's label; falls back to the prediction for unlabeled records.
    Label,
}

/// Sidecar written next to each `<sample_id>.f32` map.
///
/// The first three fields match the raw volume header, so a map reads back
/// with `volume_dataset::read_raw_volume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaliencyRecord {
    pub shape: [usize; 3],
    pub dtype: VoxelDType,
    pub endianness: Endianness,
    pub sample_id: String,
    pub predicted_class: usize,
    pub target_class: usize,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaliencySummary {
    pub records: Vec<SaliencyRecord>,
    /// Ids skipped in lenient mode.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SaliencyRunner {
    out_dir: PathBuf,
    target: TargetClass,
    strict: bool,
    stats: Option<IntensityStats>,
}

impl SaliencyRunner {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            target: TargetClass::Predicted,
            strict: true,
            stats: None,
        }
    }

    pub fn with_target(mut self, target: TargetClass) -> Self {
        self.target = target;
        self
    }

    /// Lenient runs skip samples that fail to load or attribute.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override the stats stored in the checkpoint.
    pub fn with_stats(mut self, stats: IntensityStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn map_path(&self, sample_id: &str) -> PathBuf {
        self.out_dir.join(format!("{sample_id}.f32"))
    }

    pub fn sidecar_path(&self, sample_id: &str) -> PathBuf {
        self.out_dir.join(format!("{sample_id}.json"))
    }

    pub fn run<B: Backend, A: Attribution<B>>(
        &self,
        checkpoint: &Path,
        records: &[VolumeRecord],
        loader: &dyn VolumeLoader,
        attribution: &mut A,
        device: &B::Device,
    ) -> Result<SaliencySummary, SaliencyError> {
        check_ids(records)?;
        let (model, ckpt) = load_classifier::<B>(checkpoint, device)?;
        let stats = match (&self.stats, ckpt.meta.intensity_stats) {
            (Some(stats), _) => *stats,
            (None, Some(stats)) => stats,
            (None, None) => {
                return Err(SaliencyError::MissingStats(checkpoint.to_path_buf()));
            }
        };
        stats.validate()?;
        tracing::info!(
            checkpoint = %checkpoint.display(),
            samples = records.len(),
            method = attribution.name(),
            stats = %stats.describe(),
            "generating saliency maps"
        );

        let mut summary = SaliencySummary {
            records: Vec::with_capacity(records.len()),
            skipped: Vec::new(),
        };
        for record in records {
            match self.one(&model, record, loader, &stats, attribution, device) {
                Ok(written) => summary.records.push(written),
                Err(e) if !self.strict && e.is_per_sample() => {
                    tracing::warn!(id = %record.id, error = %e, "skipping sample");
                    summary.skipped.push(record.id.clone());
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            written = summary.records.len(),
            skipped = summary.skipped.len(),
            out_dir = %self.out_dir.display(),
            "saliency done"
        );
        Ok(summary)
    }

    fn one<B: Backend, A: Attribution<B>>(
        &self,
        model: &FusionClassifier<B>,
        record: &VolumeRecord,
        loader: &dyn VolumeLoader,
        stats: &IntensityStats,
        attribution: &mut A,
        device: &B::Device,
    ) -> Result<SaliencyRecord, SaliencyError> {
        let mut volume = match loader.load(record)? {
            VolumeData::Dense(volume) => volume,
            VolumeData::Planes { .. } => {
                return Err(SaliencyError::UnsupportedInput(record.id.clone()));
            }
        };
        stats.normalize(&mut volume.voxels);
        let shape = volume.shape;
        let input = Tensor::<B, 4>::from_data(
            TensorData::new(volume.voxels, [1, shape[0], shape[1], shape[2]]),
            device,
        );

        let predicted_class = predict(model, PlaneStacks::from_volume(input.clone()))
            .first()
            .copied()
            .ok_or_else(|| SaliencyError::Attribution("empty prediction".into()))?;
        let target_class = match self.target {
            TargetClass::Predicted => predicted_class,
            TargetClass::Label => record.label.unwrap_or(predicted_class),
        };

        let map = attribution.attribute(model, input, target_class)?;
        let dims = map.dims();
        if dims != shape {
            return Err(SaliencyError::ShapeMismatch {
                id: record.id.clone(),
                expected: shape,
                found: dims,
            });
        }
        let values = map
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| SaliencyError::Attribution(format!("{e:?}")))?;
        let map = Volume::new(shape, values)?;

        let written = SaliencyRecord {
            shape,
            dtype: VoxelDType::F32,
            endianness: Endianness::Little,
            sample_id: record.id.clone(),
            predicted_class,
            target_class,
            method: attribution.name().to_string(),
        };
        self.write(&map, &written)?;
        Ok(written)
    }

    /// Map first, sidecar last: a map without a sidecar is incomplete.
    fn write(&self, map: &Volume, record: &SaliencyRecord) -> Result<(), SaliencyError> {
        let mut bytes = Vec::with_capacity(map.len() * 4);
        for v in &map.voxels {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let map_path = self.map_path(&record.sample_id);
        write_atomic(&map_path, &bytes).map_err(|source| SaliencyError::Io {
            path: map_path,
            source,
        })?;
        let sidecar = self.sidecar_path(&record.sample_id);
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&sidecar, &json).map_err(|source| SaliencyError::Io {
            path: sidecar,
            source,
        })
    }
}

/// Ids name output files: they must be unique and plain file stems.
fn check_ids(records: &[VolumeRecord]) -> Result<(), SaliencyError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        let id = record.id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(SaliencyError::InvalidSampleId(record.id.clone()));
        }
        if !seen.insert(id) {
            return Err(SaliencyError::DuplicateSample(record.id.clone()));
        }
    }
    Ok(())
}
