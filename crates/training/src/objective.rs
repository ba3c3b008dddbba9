//! Stage objectives: how a host batch becomes a loss, and how validation
//! batches reduce to a score (higher is better).

use crate::trainer::TrainError;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor, TensorData};
use models::{FusionClassifier, FusionModel, FusionPretext, PlaneStacks, PretextObjective};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use volume_dataset::{
    batch_labels, mask_slices, permute_slices, rot90, slice_grid_means, Sample, Volume, VolumeAugment,
    VolumeData,
};

/// Per-batch validation totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalTotals {
    pub loss_sum: f64,
    pub correct: usize,
    pub count: usize,
}

impl EvalTotals {
    pub fn add(&mut self, other: EvalTotals) {
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.count += other.count;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.loss_sum / self.count as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f64 / self.count as f64
        }
    }
}

pub trait Objective<B: AutodiffBackend> {
    type Model: FusionModel<B> + AutodiffModule<B>;

    /// Mean loss of one training batch, shape `[1]`.
    fn loss(&self, model: &Self::Model, batch: &[Sample], step: usize) -> Result<Tensor<B, 1>, TrainError>;

    /// Totals for one validation batch, evaluated on the inner (non-autodiff) model.
    fn evaluate(
        &self,
        model: &<Self::Model as AutodiffModule<B>>::InnerModule,
        batch: &[Sample],
        batch_index: usize,
    ) -> Result<EvalTotals, TrainError>;

    /// Reduce validation totals to a score; higher is better.
    fn score(&self, totals: &EvalTotals) -> f64;

    fn score_name(&self) -> &'static str;
}

/// First scalar of a loss tensor as `f64`.
pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .into_iter()
        .next()
        .map(f64::from)
        .unwrap_or(f64::NAN)
}

fn rng_for(seed: u64, stream: u64, index: usize) -> StdRng {
    let mix = (index as u64)
        .wrapping_add(1)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .rotate_left(17);
    StdRng::seed_from_u64(seed ^ stream ^ mix)
}

fn labels_tensor<B: Backend>(batch: &[Sample], device: &B::Device) -> Result<Tensor<B, 1, Int>, TrainError> {
    let labels = batch_labels(batch)?;
    let n = labels.len();
    Ok(Tensor::from_data(TensorData::new(labels, [n]), device))
}

/// Cross-entropy classification on the CLS embedding.
#[derive(Debug, Clone)]
pub struct SupervisedObjective {
    augment: Option<VolumeAugment>,
    seed: u64,
}

impl SupervisedObjective {
    pub fn new(augment: Option<VolumeAugment>, seed: u64) -> Self {
        Self { augment, seed }
    }
}

impl<B: AutodiffBackend> Objective<B> for SupervisedObjective {
    type Model = FusionClassifier<B>;

    fn loss(&self, model: &Self::Model, batch: &[Sample], step: usize) -> Result<Tensor<B, 1>, TrainError> {
        let device = model.encoder().device();
        let batch = match &self.augment {
            Some(augment) => {
                let mut rng = rng_for(self.seed, 0x5EED_0001, step);
                batch
                    .iter()
                    .map(|s| {
                        let mut s = s.clone();
                        augment.apply(&mut s.data, &mut rng);
                        s
                    })
                    .collect::<Vec<_>>()
            }
            None => batch.to_vec(),
        };
        let targets = labels_tensor::<B>(&batch, &device)?;
        let logits = model.forward(PlaneStacks::from_samples(&batch, &device)?);
        Ok(CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, targets))
    }

    fn evaluate(
        &self,
        model: &FusionClassifier<B::InnerBackend>,
        batch: &[Sample],
        _batch_index: usize,
    ) -> Result<EvalTotals, TrainError> {
        let device = model.encoder().device();
        let targets = labels_tensor::<B::InnerBackend>(batch, &device)?;
        let logits = model.forward(PlaneStacks::from_samples(batch, &device)?);
        let n = batch.len();
        let predicted = logits.clone().argmax(1).reshape([n]);
        let correct = predicted
            .equal(targets.clone())
            .int()
            .sum()
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .unwrap_or_default()
            .first()
            .copied()
            .unwrap_or(0) as usize;
        let loss = scalar(CrossEntropyLossConfig::new().init(&device).forward(logits, targets));
        Ok(EvalTotals {
            loss_sum: loss * n as f64,
            correct,
            count: n,
        })
    }

    fn score(&self, totals: &EvalTotals) -> f64 {
        totals.accuracy()
    }

    fn score_name(&self) -> &'static str {
        "accuracy"
    }
}

/// Self-supervised objective on unlabeled volumes.
#[derive(Debug, Clone)]
pub struct PretextLoss {
    objective: PretextObjective,
    augment: VolumeAugment,
    seed: u64,
}

impl PretextLoss {
    pub fn new(objective: PretextObjective, augment: VolumeAugment, seed: u64) -> Self {
        Self {
            objective,
            augment,
            seed,
        }
    }

    /// Two independently augmented views per sample: `[view1..., view2...]`.
    /// The second view additionally gets coarse dropout.
    fn contrastive_views(&self, batch: &[Sample], rng: &mut StdRng) -> Vec<Sample> {
        let mut first = Vec::with_capacity(batch.len());
        let mut second = Vec::with_capacity(batch.len());
        for sample in batch {
            let mut a = sample.clone();
            self.augment.apply(&mut a.data, rng);
            let mut b = sample.clone();
            self.augment.apply(&mut b.data, rng);
            self.augment.coarse_dropout(&mut b.data, rng);
            first.push(a);
            second.push(b);
        }
        first.extend(second);
        first
    }

    /// Shuffle the axial slices of about half the samples; label 1 = shuffled.
    fn slice_order_batch(&self, batch: &[Sample], rng: &mut StdRng, augment: bool) -> Vec<Sample> {
        batch
            .iter()
            .map(|sample| {
                let mut s = sample.clone();
                if augment {
                    self.augment.apply(&mut s.data, rng);
                }
                let shuffled = rng.random_bool(0.5);
                if shuffled {
                    permute_slices(axial_mut(&mut s.data), rng);
                }
                s.label = Some(usize::from(shuffled));
                s
            })
            .collect()
    }

    /// One random quarter-turn per sample, labelled `axis * 4 + k`.
    /// Planes whose two extents differ only take half turns, so batch shapes hold.
    fn rotation_batch(&self, batch: &[Sample], rng: &mut StdRng, augment: bool) -> Vec<Sample> {
        batch
            .iter()
            .map(|sample| {
                let mut s = sample.clone();
                if augment {
                    self.augment.apply(&mut s.data, rng);
                }
                let axis = rng.random_range(0..3usize);
                let plane = ROTATION_PLANES[axis];
                let square = s
                    .data
                    .volumes_mut()
                    .iter()
                    .all(|v| v.shape[plane.0] == v.shape[plane.1]);
                let k = if square {
                    rng.random_range(0..4usize)
                } else {
                    2 * rng.random_range(0..2usize)
                };
                for volume in s.data.volumes_mut() {
                    *volume = rot90(volume, plane, k);
                }
                s.label = Some(axis * 4 + k);
                s
            })
            .collect()
    }

    /// Blank a random subset of each sample's axial slices. Targets are the
    /// unmasked slices' grid means; the weights select masked slices only.
    fn masked_batch(
        &self,
        batch: &[Sample],
        rng: &mut StdRng,
        augment: bool,
        mask_ratio: f64,
        grid: usize,
    ) -> (Vec<Sample>, MaskedTargets) {
        let grid = grid.max(1);
        let cells = grid * grid;
        let mut targets = Vec::new();
        let mut weights = Vec::new();
        let mut slices = 0;
        let samples = batch
            .iter()
            .map(|sample| {
                let mut s = sample.clone();
                if augment {
                    self.augment.apply(&mut s.data, rng);
                }
                let axial = axial_mut(&mut s.data);
                targets.extend(slice_grid_means(axial, grid));
                slices = axial.shape[0];
                for masked in mask_slices(axial, mask_ratio as f32, 0.0, rng) {
                    weights.extend(std::iter::repeat(f32::from(u8::from(masked))).take(cells));
                }
                s
            })
            .collect();
        (
            samples,
            MaskedTargets {
                targets,
                weights,
                shape: [batch.len(), slices, cells],
            },
        )
    }

    fn prepare(&self, batch: &[Sample], rng: &mut StdRng, augment: bool, grid: usize) -> PretextBatch {
        match self.objective {
            PretextObjective::Contrastive { temperature } => PretextBatch::Views {
                samples: self.contrastive_views(batch, rng),
                temperature,
            },
            PretextObjective::SliceOrder => PretextBatch::Labeled {
                samples: self.slice_order_batch(batch, rng, augment),
                task: LabelTask::SliceOrder,
            },
            PretextObjective::Rotation => PretextBatch::Labeled {
                samples: self.rotation_batch(batch, rng, augment),
                task: LabelTask::Rotation,
            },
            PretextObjective::Masked { mask_ratio } => {
                let (samples, targets) = self.masked_batch(batch, rng, augment, mask_ratio, grid);
                PretextBatch::Masked { samples, targets }
            }
        }
    }
}

/// Rotation planes for `axis` 0, 1, 2 of a `[D, H, W]` volume.
const ROTATION_PLANES: [(usize, usize); 3] = [(1, 2), (0, 2), (0, 1)];

fn axial_mut(data: &mut VolumeData) -> &mut Volume {
    match data {
        VolumeData::Dense(v) => v,
        VolumeData::Planes { axial, .. } => axial,
    }
}

/// Host-side reconstruction targets, `[N, S_axial, cells]` row-major.
#[derive(Debug, Clone)]
struct MaskedTargets {
    targets: Vec<f32>,
    weights: Vec<f32>,
    shape: [usize; 3],
}

#[derive(Debug, Clone, Copy)]
enum LabelTask {
    SliceOrder,
    Rotation,
}

/// A host batch ready for one pretext forward pass.
enum PretextBatch {
    Views { samples: Vec<Sample>, temperature: f64 },
    Labeled { samples: Vec<Sample>, task: LabelTask },
    Masked { samples: Vec<Sample>, targets: MaskedTargets },
}

/// NT-Xent over `2N` projections where row `i` and row `i + N` are positives.
pub fn nt_xent<B: Backend>(z: Tensor<B, 2>, temperature: f64) -> Tensor<B, 1> {
    let [rows, _] = z.dims();
    let device = z.device();
    let half = rows / 2;
    let norm = z.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-8);
    let z = z / norm;
    let sim = z.clone().matmul(z.transpose()).div_scalar(temperature);
    let mut diag = vec![0f32; rows * rows];
    for i in 0..rows {
        diag[i * rows + i] = 1e9;
    }
    let sim = sim - Tensor::<B, 2>::from_data(TensorData::new(diag, [rows, rows]), &device);
    let targets: Vec<i64> = (0..rows)
        .map(|i| if i < half { (i + half) as i64 } else { (i - half) as i64 })
        .collect();
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [rows]), &device);
    CrossEntropyLossConfig::new().init(&device).forward(sim, targets)
}

/// Mean squared error over the cells of masked slices only.
fn masked_mse<B: Backend>(pred: Tensor<B, 3>, masked: MaskedTargets, device: &B::Device) -> Tensor<B, 1> {
    let count = masked.weights.iter().sum::<f32>().max(1.0);
    let target = Tensor::<B, 3>::from_data(TensorData::new(masked.targets, masked.shape), device);
    let weight = Tensor::<B, 3>::from_data(TensorData::new(masked.weights, masked.shape), device);
    (pred - target)
        .powf_scalar(2.0)
        .mul(weight)
        .sum()
        .div_scalar(count)
}

fn pretext_loss<B: Backend>(model: &FusionPretext<B>, batch: PretextBatch) -> Result<Tensor<B, 1>, TrainError> {
    let device = model.encoder().device();
    match batch {
        PretextBatch::Views { samples, temperature } => {
            let stacks = PlaneStacks::from_samples(&samples, &device)?;
            Ok(nt_xent(model.project(stacks), temperature))
        }
        PretextBatch::Labeled { samples, task } => {
            let stacks = PlaneStacks::from_samples(&samples, &device)?;
            let targets = labels_tensor::<B>(&samples, &device)?;
            let logits = match task {
                LabelTask::SliceOrder => model.slice_order_logits(stacks),
                LabelTask::Rotation => model.rotation_logits(stacks),
            };
            Ok(CrossEntropyLossConfig::new().init(&device).forward(logits, targets))
        }
        PretextBatch::Masked { samples, targets } => {
            let stacks = PlaneStacks::from_samples(&samples, &device)?;
            Ok(masked_mse(model.reconstruct_axial(stacks), targets, &device))
        }
    }
}

fn recon_grid<B: Backend>(model: &FusionPretext<B>) -> usize {
    model.head().config.recon_grid
}

impl<B: AutodiffBackend> Objective<B> for PretextLoss {
    type Model = FusionPretext<B>;

    fn loss(&self, model: &Self::Model, batch: &[Sample], step: usize) -> Result<Tensor<B, 1>, TrainError> {
        let mut rng = rng_for(self.seed, 0x5EED_0002, step);
        let prepared = self.prepare(batch, &mut rng, true, recon_grid(model));
        pretext_loss(model, prepared)
    }

    fn evaluate(
        &self,
        model: &FusionPretext<B::InnerBackend>,
        batch: &[Sample],
        batch_index: usize,
    ) -> Result<EvalTotals, TrainError> {
        // Fixed per-batch stream so every epoch scores the same views.
        let mut rng = rng_for(self.seed, 0x5EED_0003, batch_index);
        let prepared = self.prepare(batch, &mut rng, false, recon_grid(model));
        let loss = scalar(pretext_loss(model, prepared)?);
        Ok(EvalTotals {
            loss_sum: loss * batch.len() as f64,
            correct: 0,
            count: batch.len(),
        })
    }

    fn score(&self, totals: &EvalTotals) -> f64 {
        -totals.mean_loss()
    }

    fn score_name(&self) -> &'static str {
        "neg_pretext_loss"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use volume_dataset::AugmentConfig;

    type B = NdArray<f32>;

    fn ramp_samples(n: usize, shape: [usize; 3]) -> Vec<Sample> {
        let voxels = shape.iter().product::<usize>();
        (0..n)
            .map(|i| Sample {
                id: format!("s{i}"),
                data: VolumeData::Dense(
                    Volume::new(shape, (0..voxels).map(|v| (v + i) as f32).collect()).unwrap(),
                ),
                label: None,
            })
            .collect()
    }

    fn pretext(objective: PretextObjective, augment: AugmentConfig) -> PretextLoss {
        PretextLoss::new(objective, VolumeAugment::new(augment), 7)
    }

    #[test]
    fn only_the_second_view_gets_coarse_dropout() {
        let loss = pretext(
            PretextObjective::default(),
            AugmentConfig {
                dropout_prob: 1.0,
                dropout_holes: 1,
                dropout_size: 2,
                dropout_fill: -5.0,
                ..AugmentConfig::disabled()
            },
        );
        let batch = ramp_samples(3, [4, 4, 4]);
        let views = loss.contrastive_views(&batch, &mut StdRng::seed_from_u64(1));
        assert_eq!(views.len(), 6);
        for (view, original) in views[..3].iter().zip(&batch) {
            assert_eq!(view.data, original.data);
        }
        for view in &views[3..] {
            let dense = view.data.as_dense().unwrap();
            assert!(dense.voxels.iter().any(|v| *v == -5.0));
        }
    }

    #[test]
    fn slice_order_labels_are_a_fair_coin() {
        let loss = pretext(PretextObjective::SliceOrder, AugmentConfig::disabled());
        let batch = ramp_samples(400, [4, 2, 2]);
        let out = loss.slice_order_batch(&batch, &mut StdRng::seed_from_u64(3), false);
        let shuffled = out.iter().filter(|s| s.label == Some(1)).count();
        assert!((160..=240).contains(&shuffled), "{shuffled} of 400 shuffled");
        for (s, original) in out.iter().zip(&batch) {
            assert_eq!(s.label == Some(1), s.data != original.data);
        }
    }

    #[test]
    fn rotation_labels_undo_to_the_original() {
        let loss = pretext(PretextObjective::Rotation, AugmentConfig::disabled());
        let batch = ramp_samples(200, [2, 3, 3]);
        let out = loss.rotation_batch(&batch, &mut StdRng::seed_from_u64(9), false);
        let mut seen = [false; 12];
        for (s, original) in out.iter().zip(&batch) {
            let label = s.label.unwrap();
            seen[label] = true;
            let (axis, k) = (label / 4, label % 4);
            let dense = s.data.as_dense().unwrap();
            assert_eq!(dense.shape, [2, 3, 3]);
            let undone = rot90(dense, ROTATION_PLANES[axis], (4 - k) % 4);
            assert_eq!(Some(&undone), original.data.as_dense());
        }
        // Only the square H x W plane takes odd turns.
        let odd: Vec<usize> = (0..12).filter(|l| seen[*l] && l % 2 == 1).collect();
        assert!(odd.iter().all(|l| *l < 4));
        assert!(seen[1] && seen[3] && seen[6] && seen[10]);
    }

    #[test]
    fn masked_batch_blanks_slices_and_keeps_clean_targets() {
        let loss = pretext(PretextObjective::Masked { mask_ratio: 0.5 }, AugmentConfig::disabled());
        let batch = ramp_samples(4, [6, 2, 2]);
        let (out, masked) = loss.masked_batch(&batch, &mut StdRng::seed_from_u64(4), false, 0.5, 1);
        assert_eq!(masked.shape, [4, 6, 1]);
        for (i, (s, original)) in out.iter().zip(&batch).enumerate() {
            let dense = s.data.as_dense().unwrap();
            let clean = original.data.as_dense().unwrap();
            let weights = &masked.weights[i * 6..(i + 1) * 6];
            assert!(weights.iter().any(|w| *w == 1.0));
            for (slice, w) in weights.iter().enumerate() {
                let got = &dense.voxels[slice * 4..(slice + 1) * 4];
                let want = &clean.voxels[slice * 4..(slice + 1) * 4];
                if *w == 1.0 {
                    assert!(got.iter().all(|v| *v == 0.0));
                } else {
                    assert_eq!(got, want);
                }
                let mean = want.iter().sum::<f32>() / 4.0;
                assert_eq!(masked.targets[i * 6 + slice], mean);
            }
        }
    }

    #[test]
    fn nt_xent_prefers_aligned_pairs() {
        let device = Default::default();
        let aligned = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0], [4, 2]),
            &device,
        );
        let crossed = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0], [4, 2]),
            &device,
        );
        let good = scalar(nt_xent(aligned, 0.1));
        let bad = scalar(nt_xent(crossed, 0.1));
        assert!(good.is_finite() && bad.is_finite());
        assert!(good < bad, "aligned {good} vs crossed {bad}");
    }

    #[test]
    fn eval_totals_reduce() {
        let mut t = EvalTotals::default();
        t.add(EvalTotals {
            loss_sum: 2.0,
            correct: 1,
            count: 2,
        });
        t.add(EvalTotals {
            loss_sum: 1.0,
            correct: 2,
            count: 2,
        });
        assert_eq!(t.mean_loss(), 0.75);
        assert_eq!(t.accuracy(), 0.75);
    }
}
