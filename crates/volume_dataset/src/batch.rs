//! Ordered batch iteration over a partition, plus host-side plane stacking.

use crate::loader::VolumeLoader;
use crate::types::{DatasetError, DatasetResult, Sample};
use data_contracts::{IntensityStats, Plane, VolumeRecord};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::Arc;

/// A source of host batches, consumed strictly in order by the training loop.
pub trait BatchSource {
    /// Reset the cursor and (re)shuffle for `epoch`; the order depends only on
    /// the source seed and the epoch index.
    fn start_epoch(&mut self, epoch: usize);

    /// Next batch of the current epoch, or `None` once it is exhausted.
    fn next_batch(&mut self) -> DatasetResult<Option<Vec<Sample>>>;

    /// Batches per epoch, assuming nothing is skipped.
    fn len_batches(&self) -> usize;

    fn len_samples(&self) -> usize;

    /// Samples skipped so far in lenient mode.
    fn skipped(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub drop_last: bool,
    /// Fail on an unreadable volume instead of skipping it with a warning.
    pub strict: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            shuffle: true,
            seed: 42,
            drop_last: false,
            strict: false,
        }
    }
}

impl BatchConfig {
    /// Validation iteration: fixed order, keep the tail.
    pub fn eval(batch_size: usize, strict: bool) -> Self {
        Self {
            batch_size,
            shuffle: false,
            seed: 0,
            drop_last: false,
            strict,
        }
    }
}

fn epoch_order(len: usize, cfg: &BatchConfig, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if cfg.shuffle {
        let mix = (epoch as u64).wrapping_add(1).wrapping_mul(0xA24B_AED4_963E_E407);
        let mut rng = rand::rngs::StdRng::seed_from_u64(cfg.seed ^ mix);
        order.shuffle(&mut rng);
    }
    order
}

fn batch_count(len: usize, cfg: &BatchConfig) -> usize {
    let size = cfg.batch_size.max(1);
    if cfg.drop_last {
        len / size
    } else {
        len.div_ceil(size)
    }
}

/// Loads records lazily through a [`VolumeLoader`] and normalizes them.
pub struct RecordBatches {
    records: Vec<VolumeRecord>,
    loader: Arc<dyn VolumeLoader>,
    stats: IntensityStats,
    cfg: BatchConfig,
    order: Vec<usize>,
    cursor: usize,
    skipped: usize,
}

impl RecordBatches {
    pub fn new(
        records: Vec<VolumeRecord>,
        loader: Arc<dyn VolumeLoader>,
        stats: IntensityStats,
        cfg: BatchConfig,
    ) -> Self {
        let order = (0..records.len()).collect();
        Self {
            records,
            loader,
            stats,
            cfg,
            order,
            cursor: 0,
            skipped: 0,
        }
    }

    fn load_one(&self, record: &VolumeRecord) -> DatasetResult<Sample> {
        let mut data = self.loader.load(record)?;
        for volume in data.volumes_mut() {
            self.stats.normalize(&mut volume.voxels);
        }
        Ok(Sample {
            id: record.id.clone(),
            data,
            label: record.label,
        })
    }
}

impl BatchSource for RecordBatches {
    fn start_epoch(&mut self, epoch: usize) {
        self.order = epoch_order(self.records.len(), &self.cfg, epoch);
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> DatasetResult<Option<Vec<Sample>>> {
        let size = self.cfg.batch_size.max(1);
        loop {
            let remaining = self.order.len().saturating_sub(self.cursor);
            if remaining == 0 || (self.cfg.drop_last && remaining < size) {
                return Ok(None);
            }
            let end = (self.cursor + size).min(self.order.len());
            let slice = &self.order[self.cursor..end];
            self.cursor = end;

            // Parallel load; indexed collect keeps the epoch order.
            let loaded: Vec<(usize, DatasetResult<Sample>)> = slice
                .par_iter()
                .map(|&i| (i, self.load_one(&self.records[i])))
                .collect();
            let mut batch = Vec::with_capacity(loaded.len());
            for (i, result) in loaded {
                match result {
                    Ok(sample) => batch.push(sample),
                    Err(e) if !self.cfg.strict => {
                        self.skipped += 1;
                        tracing::warn!(id = %self.records[i].id, error = %e, "skipping unreadable volume");
                    }
                    Err(e) => return Err(e),
                }
            }
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
    }

    fn len_batches(&self) -> usize {
        batch_count(self.records.len(), &self.cfg)
    }

    fn len_samples(&self) -> usize {
        self.records.len()
    }

    fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Batches over samples already held in memory.
pub struct SampleBatches {
    samples: Vec<Sample>,
    cfg: BatchConfig,
    order: Vec<usize>,
    cursor: usize,
}

impl SampleBatches {
    pub fn new(samples: Vec<Sample>, cfg: BatchConfig) -> Self {
        let order = (0..samples.len()).collect();
        Self {
            samples,
            cfg,
            order,
            cursor: 0,
        }
    }
}

impl BatchSource for SampleBatches {
    fn start_epoch(&mut self, epoch: usize) {
        self.order = epoch_order(self.samples.len(), &self.cfg, epoch);
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> DatasetResult<Option<Vec<Sample>>> {
        let size = self.cfg.batch_size.max(1);
        let remaining = self.order.len().saturating_sub(self.cursor);
        if remaining == 0 || (self.cfg.drop_last && remaining < size) {
            return Ok(None);
        }
        let end = (self.cursor + size).min(self.order.len());
        let batch = self.order[self.cursor..end]
            .iter()
            .map(|&i| self.samples[i].clone())
            .collect();
        self.cursor = end;
        Ok(Some(batch))
    }

    fn len_batches(&self) -> usize {
        batch_count(self.samples.len(), &self.cfg)
    }

    fn len_samples(&self) -> usize {
        self.samples.len()
    }
}

/// One plane of a batch, flattened as `[N, S, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneBatch {
    pub plane: Plane,
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

/// Stack the `plane` view of every sample. All samples must share the stack shape.
pub fn stack_plane(samples: &[Sample], plane: Plane) -> DatasetResult<PlaneBatch> {
    let first = samples
        .first()
        .ok_or_else(|| DatasetError::Other("cannot stack an empty batch".into()))?;
    let expected = first.data.stack(plane).shape;
    let mut data = Vec::with_capacity(samples.len() * expected.iter().product::<usize>());
    for sample in samples {
        let stack = sample.data.stack(plane);
        if stack.shape != expected {
            return Err(DatasetError::ShapeMismatch {
                id: sample.id.clone(),
                plane: plane.as_str(),
                found: stack.shape,
                expected,
            });
        }
        data.extend_from_slice(&stack.voxels);
    }
    Ok(PlaneBatch {
        plane,
        shape: [samples.len(), expected[0], expected[1], expected[2]],
        data,
    })
}

/// Class indices of a labeled batch; errors if any sample is unlabeled.
pub fn batch_labels(samples: &[Sample]) -> DatasetResult<Vec<i64>> {
    samples
        .iter()
        .map(|s| {
            s.label
                .map(|l| l as i64)
                .ok_or_else(|| DatasetError::Other(format!("sample {} has no label", s.id)))
        })
        .collect()
}
