//! Host-side volume augmentation. All randomness comes from the caller's RNG so
//! a `(seed, epoch, sample)` triple always reproduces the same views.

use crate::types::{Volume, VolumeData};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Probability of flipping along each of the three axes, independently.
    pub flip_prob: f32,
    /// Probability of one small random affine (rotate, translate, scale).
    pub affine_prob: f32,
    /// Max rotation per axis in radians.
    pub affine_rotate: f32,
    /// Max translation per axis in voxels.
    pub affine_translate: f32,
    /// Per-axis zoom `1 + u`, `u ~ U(-scale, scale)`.
    pub affine_scale: f32,
    pub contrast_prob: f32,
    /// Gamma range for the min-max preserving contrast curve.
    pub contrast_gamma: [f32; 2],
    pub scale_prob: f32,
    /// Multiply intensities by `1 + u`, `u ~ U(-scale, scale)`.
    pub intensity_scale: f32,
    pub shift_prob: f32,
    /// Add `u ~ U(-shift, shift)` to every voxel.
    pub intensity_shift: f32,
    pub noise_prob: f32,
    pub noise_std: f32,
    pub smooth_prob: f32,
    /// Gaussian sigma per axis is drawn from `U(0, smooth_sigma)`.
    pub smooth_sigma: f32,
    pub dropout_prob: f32,
    /// Cubic holes filled by `coarse_dropout`.
    pub dropout_holes: usize,
    pub dropout_size: usize,
    pub dropout_fill: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            flip_prob: 0.5,
            affine_prob: 0.7,
            affine_rotate: std::f32::consts::PI / 36.0,
            affine_translate: 4.0,
            affine_scale: 0.05,
            contrast_prob: 0.3,
            contrast_gamma: [0.7, 1.4],
            scale_prob: 0.3,
            intensity_scale: 0.15,
            shift_prob: 0.3,
            intensity_shift: 0.10,
            noise_prob: 0.25,
            noise_std: 0.01,
            smooth_prob: 0.15,
            smooth_sigma: 1.0,
            dropout_prob: 0.2,
            dropout_holes: 4,
            dropout_size: 16,
            dropout_fill: 0.0,
        }
    }
}

impl AugmentConfig {
    /// No-op pipeline, used for validation and inference.
    pub fn disabled() -> Self {
        Self {
            flip_prob: 0.0,
            affine_prob: 0.0,
            contrast_prob: 0.0,
            scale_prob: 0.0,
            shift_prob: 0.0,
            noise_prob: 0.0,
            smooth_prob: 0.0,
            dropout_prob: 0.0,
            ..Self::default()
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "flip_p={:.2} affine_p={:.2} contrast_p={:.2} gamma={:.2}..{:.2} scale_p={:.2} ±{:.2} \
             shift_p={:.2} ±{:.2} noise_p={:.2} std={:.3} smooth_p={:.2} sigma<{:.2} dropout_p={:.2} {}x{}³",
            self.flip_prob,
            self.affine_prob,
            self.contrast_prob,
            self.contrast_gamma[0],
            self.contrast_gamma[1],
            self.scale_prob,
            self.intensity_scale,
            self.shift_prob,
            self.intensity_shift,
            self.noise_prob,
            self.noise_std,
            self.smooth_prob,
            self.smooth_sigma,
            self.dropout_prob,
            self.dropout_holes,
            self.dropout_size
        )
    }
}

fn chance<R: Rng + ?Sized>(rng: &mut R, p: f32) -> bool {
    p > 0.0 && rng.random::<f32>() < p
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, half: f32) -> f32 {
    if half > 0.0 {
        rng.random_range(-half..=half)
    } else {
        0.0
    }
}

/// Parameters of one random affine, shared by every stack of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    /// Rotation about the D, H and W axes, radians.
    pub angles: [f32; 3],
    pub translate: [f32; 3],
    pub scale: [f32; 3],
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            angles: [0.0; 3],
            translate: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeAugment {
    cfg: AugmentConfig,
}

impl VolumeAugment {
    pub fn new(cfg: AugmentConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.cfg
    }

    /// Flips, affine, contrast, intensity scale and shift, noise, smoothing.
    /// Each step after the flips fires with its own probability; draws are
    /// made once per sample and applied to every stack of it.
    pub fn apply<R: Rng + ?Sized>(&self, data: &mut VolumeData, rng: &mut R) {
        let cfg = &self.cfg;
        for volume in data.volumes_mut() {
            for axis in 0..3 {
                if chance(rng, cfg.flip_prob) {
                    flip(volume, axis);
                }
            }
        }
        if chance(rng, cfg.affine_prob) {
            let params = AffineParams {
                angles: std::array::from_fn(|_| symmetric(rng, cfg.affine_rotate)),
                translate: std::array::from_fn(|_| symmetric(rng, cfg.affine_translate)),
                scale: std::array::from_fn(|_| 1.0 + symmetric(rng, cfg.affine_scale)),
            };
            for volume in data.volumes_mut() {
                *volume = affine(volume, &params);
            }
        }
        if chance(rng, cfg.contrast_prob) {
            let [lo, hi] = cfg.contrast_gamma;
            let gamma = if hi > lo { rng.random_range(lo..=hi) } else { lo };
            for volume in data.volumes_mut() {
                adjust_contrast(volume, gamma);
            }
        }
        let scale = if chance(rng, cfg.scale_prob) {
            1.0 + symmetric(rng, cfg.intensity_scale)
        } else {
            1.0
        };
        let shift = if chance(rng, cfg.shift_prob) {
            symmetric(rng, cfg.intensity_shift)
        } else {
            0.0
        };
        let noise = (cfg.noise_std > 0.0 && chance(rng, cfg.noise_prob))
            .then(|| Normal::new(0.0f32, cfg.noise_std).ok())
            .flatten();
        for volume in data.volumes_mut() {
            if scale != 1.0 || shift != 0.0 {
                for v in volume.voxels.iter_mut() {
                    *v = *v * scale + shift;
                }
            }
            if let Some(noise) = &noise {
                for v in volume.voxels.iter_mut() {
                    *v += noise.sample(rng);
                }
            }
        }
        if chance(rng, cfg.smooth_prob) {
            let sigma: [f32; 3] = std::array::from_fn(|_| {
                if cfg.smooth_sigma > 0.0 {
                    rng.random_range(0.0..=cfg.smooth_sigma)
                } else {
                    0.0
                }
            });
            for volume in data.volumes_mut() {
                gaussian_smooth(volume, sigma);
            }
        }
    }

    /// With probability `dropout_prob`, fill 1..=`dropout_holes` cubes of edge
    /// `dropout_size` (clipped to the volume) with `dropout_fill`.
    pub fn coarse_dropout<R: Rng + ?Sized>(&self, data: &mut VolumeData, rng: &mut R) {
        if self.cfg.dropout_holes == 0 || self.cfg.dropout_size == 0 {
            return;
        }
        if !chance(rng, self.cfg.dropout_prob) {
            return;
        }
        for volume in data.volumes_mut() {
            let holes = rng.random_range(1..=self.cfg.dropout_holes);
            for _ in 0..holes {
                let mut lo = [0usize; 3];
                let mut hi = [0usize; 3];
                for axis in 0..3 {
                    let edge = self.cfg.dropout_size.min(volume.shape[axis]);
                    lo[axis] = rng.random_range(0..=volume.shape[axis] - edge);
                    hi[axis] = lo[axis] + edge;
                }
                for d in lo[0]..hi[0] {
                    for h in lo[1]..hi[1] {
                        let start = volume.index(d, h, lo[2]);
                        let end = volume.index(d, h, hi[2] - 1) + 1;
                        volume.voxels[start..end].fill(self.cfg.dropout_fill);
                    }
                }
            }
        }
    }
}

/// Trilinear read at fractional `(d, h, w)`, clamped to the border.
fn sample_border(volume: &Volume, at: [f32; 3]) -> f32 {
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut frac = [0f32; 3];
    for axis in 0..3 {
        let max = (volume.shape[axis] - 1) as f32;
        let x = at[axis].clamp(0.0, max);
        let floor = x.floor();
        lo[axis] = floor as usize;
        hi[axis] = (lo[axis] + 1).min(volume.shape[axis] - 1);
        frac[axis] = x - floor;
    }
    let mut acc = 0.0;
    for corner in 0..8 {
        let pick = |axis: usize| (corner >> axis) & 1 == 1;
        let mut weight = 1.0;
        let mut idx = [0usize; 3];
        for axis in 0..3 {
            if pick(axis) {
                weight *= frac[axis];
                idx[axis] = hi[axis];
            } else {
                weight *= 1.0 - frac[axis];
                idx[axis] = lo[axis];
            }
        }
        if weight > 0.0 {
            acc += weight * volume.voxels[volume.index(idx[0], idx[1], idx[2])];
        }
    }
    acc
}

/// Resample `volume` under a rotation/scale about its centre plus a
/// translation, with border padding. Output keeps the input shape.
pub fn affine(volume: &Volume, params: &AffineParams) -> Volume {
    let [a, b, g] = params.angles;
    let (sa, ca) = a.sin_cos();
    let (sb, cb) = b.sin_cos();
    let (sg, cg) = g.sin_cos();
    let rx = [[1.0, 0.0, 0.0], [0.0, ca, -sa], [0.0, sa, ca]];
    let ry = [[cb, 0.0, sb], [0.0, 1.0, 0.0], [-sb, 0.0, cb]];
    let rz = [[cg, -sg, 0.0], [sg, cg, 0.0], [0.0, 0.0, 1.0]];
    let rot = matmul3(&rz, &matmul3(&ry, &rx));
    // Inverse of R * diag(s) is diag(1/s) * R^T.
    let inv: [[f32; 3]; 3] = std::array::from_fn(|i| std::array::from_fn(|j| rot[j][i] / params.scale[i]));
    let centre: [f32; 3] = std::array::from_fn(|axis| (volume.shape[axis] - 1) as f32 / 2.0);

    let [d, h, w] = volume.shape;
    let mut out = Vec::with_capacity(volume.len());
    for di in 0..d {
        for hi in 0..h {
            for wi in 0..w {
                let p = [di as f32, hi as f32, wi as f32];
                let q: [f32; 3] = std::array::from_fn(|axis| p[axis] - centre[axis] - params.translate[axis]);
                let src: [f32; 3] = std::array::from_fn(|i| {
                    inv[i][0] * q[0] + inv[i][1] * q[1] + inv[i][2] * q[2] + centre[i]
                });
                out.push(sample_border(volume, src));
            }
        }
    }
    Volume {
        shape: volume.shape,
        voxels: out,
    }
}

fn matmul3(x: &[[f32; 3]; 3], y: &[[f32; 3]; 3]) -> [[f32; 3]; 3] {
    std::array::from_fn(|i| std::array::from_fn(|j| (0..3).map(|k| x[i][k] * y[k][j]).sum()))
}

/// `((v - min) / range) ^ gamma * range + min`; a flat volume is left alone.
pub fn adjust_contrast(volume: &mut Volume, gamma: f32) {
    let (min, max) = volume
        .voxels
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = max - min;
    if range.is_nan() || range <= 0.0 {
        return;
    }
    const EPS: f32 = 1e-7;
    for v in volume.voxels.iter_mut() {
        *v = ((*v - min) / (range + EPS)).powf(gamma) * range + min;
    }
}

/// Separable Gaussian blur with per-axis sigma; axes with a negligible sigma
/// are skipped. Edges replicate the border voxel.
pub fn gaussian_smooth(volume: &mut Volume, sigma: [f32; 3]) {
    for (axis, s) in sigma.into_iter().enumerate() {
        if s < 1e-3 || volume.shape[axis] < 2 {
            continue;
        }
        let radius = (3.0 * s).ceil() as isize;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|x| (-(x * x) as f32 / (2.0 * s * s)).exp())
            .collect();
        let total: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= total);

        let len = volume.shape[axis] as isize;
        let stride = match axis {
            0 => volume.shape[1] * volume.shape[2],
            1 => volume.shape[2],
            _ => 1,
        };
        let src = volume.voxels.clone();
        for (i, out) in volume.voxels.iter_mut().enumerate() {
            let pos = (i / stride) as isize % len;
            let base = i - pos as usize * stride;
            *out = kernel
                .iter()
                .zip(-radius..=radius)
                .map(|(k, off)| k * src[base + (pos + off).clamp(0, len - 1) as usize * stride])
                .sum();
        }
    }
}

/// `torch.rot90`-style quarter turns in the plane of axes `plane = (a, b)`,
/// rotating from `a` towards `b`. Odd `k` swaps the two extents.
pub fn rot90(volume: &Volume, plane: (usize, usize), k: usize) -> Volume {
    let mut out = volume.clone();
    for _ in 0..k % 4 {
        out = rot90_once(&out, plane);
    }
    out
}

fn rot90_once(volume: &Volume, (a, b): (usize, usize)) -> Volume {
    let mut shape = volume.shape;
    shape.swap(a, b);
    let mut voxels = Vec::with_capacity(volume.len());
    for d in 0..shape[0] {
        for h in 0..shape[1] {
            for w in 0..shape[2] {
                let o = [d, h, w];
                let mut src = o;
                src[a] = o[b];
                src[b] = volume.shape[b] - 1 - o[a];
                voxels.push(volume.voxels[volume.index(src[0], src[1], src[2])]);
            }
        }
    }
    Volume { shape, voxels }
}

/// Mark each leading-axis slice with probability `ratio` (at least one is
/// always marked) and fill the marked slices with `fill`.
pub fn mask_slices<R: Rng + ?Sized>(volume: &mut Volume, ratio: f32, fill: f32, rng: &mut R) -> Vec<bool> {
    let depth = volume.shape[0];
    let mut mask: Vec<bool> = (0..depth).map(|_| rng.random::<f32>() < ratio).collect();
    if !mask.iter().any(|m| *m) {
        mask[rng.random_range(0..depth)] = true;
    }
    let slice = volume.shape[1] * volume.shape[2];
    for (i, _) in mask.iter().enumerate().filter(|(_, m)| **m) {
        volume.voxels[i * slice..(i + 1) * slice].fill(fill);
    }
    mask
}

/// Mean intensity of each cell of a `grid x grid` partition of every
/// leading-axis slice, as `[D, grid * grid]` row-major. Cells never come out
/// empty, even when a slice is smaller than the grid.
pub fn slice_grid_means(volume: &Volume, grid: usize) -> Vec<f32> {
    let [d, h, w] = volume.shape;
    let span = |cell: usize, len: usize| {
        let start = (cell * len / grid).min(len - 1);
        let end = ((cell + 1) * len).div_ceil(grid).clamp(start + 1, len);
        start..end
    };
    let mut out = Vec::with_capacity(d * grid * grid);
    for di in 0..d {
        for gy in 0..grid {
            for gx in 0..grid {
                let (rows, cols) = (span(gy, h), span(gx, w));
                let count = (rows.len() * cols.len()) as f32;
                let sum: f32 = rows
                    .flat_map(|hi| cols.clone().map(move |wi| (hi, wi)))
                    .map(|(hi, wi)| volume.voxels[volume.index(di, hi, wi)])
                    .sum();
                out.push(sum / count);
            }
        }
    }
    out
}

/// Reverse `volume` along `axis` (0 = D, 1 = H, 2 = W).
pub fn flip(volume: &mut Volume, axis: usize) {
    let [d, h, w] = volume.shape;
    match axis {
        0 => {
            for di in 0..d / 2 {
                for hi in 0..h {
                    for wi in 0..w {
                        let a = volume.index(di, hi, wi);
                        let b = volume.index(d - 1 - di, hi, wi);
                        volume.voxels.swap(a, b);
                    }
                }
            }
        }
        1 => {
            for di in 0..d {
                for hi in 0..h / 2 {
                    for wi in 0..w {
                        let a = volume.index(di, hi, wi);
                        let b = volume.index(di, h - 1 - hi, wi);
                        volume.voxels.swap(a, b);
                    }
                }
            }
        }
        _ => {
            for row in volume.voxels.chunks_exact_mut(w) {
                row.reverse();
            }
        }
    }
}

/// Reorder the leading-axis slices by `order` (a permutation of `0..D`).
pub fn reorder_slices(volume: &mut Volume, order: &[usize]) {
    let slice = volume.shape[1] * volume.shape[2];
    let mut out = Vec::with_capacity(volume.len());
    for &src in order {
        out.extend_from_slice(&volume.voxels[src * slice..(src + 1) * slice]);
    }
    volume.voxels = out;
}

/// Shuffle the leading-axis slices in place and return the permutation applied.
/// Retries until the order actually changes when there are at least two slices.
pub fn permute_slices<R: Rng + ?Sized>(volume: &mut Volume, rng: &mut R) -> Vec<usize> {
    let depth = volume.shape[0];
    let identity: Vec<usize> = (0..depth).collect();
    let mut order = identity.clone();
    if depth < 2 {
        return order;
    }
    while order == identity {
        order.shuffle(rng);
    }
    reorder_slices(volume, &order);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn ramp(shape: [usize; 3]) -> Volume {
        Volume::new(shape, (0..shape.iter().product::<usize>()).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn flipping_twice_restores_volume() {
        let original = ramp([3, 4, 5]);
        for axis in 0..3 {
            let mut v = original.clone();
            flip(&mut v, axis);
            assert_ne!(v, original);
            flip(&mut v, axis);
            assert_eq!(v, original);
        }
    }

    #[test]
    fn flip_depth_swaps_first_and_last_slice() {
        let mut v = ramp([2, 1, 2]);
        flip(&mut v, 0);
        assert_eq!(v.voxels, vec![2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn same_seed_gives_same_augmentation() {
        let aug = VolumeAugment::new(AugmentConfig::default());
        let run = |seed| {
            let mut data = VolumeData::Dense(ramp([4, 4, 4]));
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            aug.apply(&mut data, &mut rng);
            aug.coarse_dropout(&mut data, &mut rng);
            data
        };
        assert_eq!(run(11), run(11));
    }

    #[test]
    fn disabled_config_is_identity() {
        let aug = VolumeAugment::new(AugmentConfig::disabled());
        let mut data = VolumeData::Dense(ramp([2, 3, 4]));
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        aug.apply(&mut data, &mut rng);
        aug.coarse_dropout(&mut data, &mut rng);
        assert_eq!(data, VolumeData::Dense(ramp([2, 3, 4])));
    }

    #[test]
    fn coarse_dropout_zeroes_a_clipped_cube() {
        let aug = VolumeAugment::new(AugmentConfig {
            dropout_prob: 1.0,
            dropout_holes: 1,
            dropout_size: 16,
            ..AugmentConfig::disabled()
        });
        let mut data = VolumeData::Dense(Volume::filled([4, 4, 4], 1.0));
        aug.coarse_dropout(&mut data, &mut rand::rngs::StdRng::seed_from_u64(3));
        // Hole edge clips to the whole volume.
        assert!(data.as_dense().unwrap().voxels.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn permuted_slices_are_a_real_permutation() {
        let mut v = ramp([6, 2, 2]);
        let mut rng = rand::rngs::StdRng::seed_from_u64(8);
        let order = permute_slices(&mut v, &mut rng);
        assert_ne!(order, (0..6).collect::<Vec<_>>());
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..6).collect::<Vec<_>>());
        assert_eq!(v.voxels[0], (order[0] * 4) as f32);
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn zero_step_probabilities_gate_intensity_and_dropout() {
        let gated = AugmentConfig {
            intensity_scale: 0.5,
            intensity_shift: 0.5,
            dropout_holes: 2,
            dropout_size: 2,
            ..AugmentConfig::disabled()
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let aug = VolumeAugment::new(gated);
        let mut data = VolumeData::Dense(ramp([2, 3, 4]));
        aug.apply(&mut data, &mut rng);
        aug.coarse_dropout(&mut data, &mut rng);
        assert_eq!(data, VolumeData::Dense(ramp([2, 3, 4])));

        let aug = VolumeAugment::new(AugmentConfig {
            scale_prob: 1.0,
            shift_prob: 1.0,
            ..gated
        });
        aug.apply(&mut data, &mut rng);
        assert_ne!(data, VolumeData::Dense(ramp([2, 3, 4])));
    }

    #[test]
    fn identity_affine_keeps_voxels() {
        let v = ramp([3, 4, 5]);
        assert!(close(&affine(&v, &AffineParams::identity()).voxels, &v.voxels));
    }

    #[test]
    fn affine_translation_pads_with_the_border() {
        let v = Volume::new([4, 1, 1], vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let params = AffineParams {
            translate: [1.0, 0.0, 0.0],
            ..AffineParams::identity()
        };
        assert!(close(&affine(&v, &params).voxels, &[0.0, 0.0, 1.0, 2.0]));
    }

    #[test]
    fn rotated_constant_volume_stays_constant() {
        let v = Volume::filled([5, 5, 5], 2.5);
        let params = AffineParams {
            angles: [0.08, -0.05, 0.03],
            translate: [1.5, -2.0, 0.5],
            scale: [1.05, 0.95, 1.0],
        };
        assert!(affine(&v, &params).voxels.iter().all(|x| (x - 2.5).abs() < 1e-5));
    }

    #[test]
    fn contrast_gamma_keeps_range_and_bends_midtones() {
        let mut v = Volume::new([1, 1, 3], vec![0.0, 0.5, 1.0]).unwrap();
        adjust_contrast(&mut v, 2.0);
        assert!(close(&v.voxels, &[0.0, 0.25, 1.0]));

        let mut flat = Volume::filled([2, 2, 2], 3.0);
        adjust_contrast(&mut flat, 0.7);
        assert_eq!(flat, Volume::filled([2, 2, 2], 3.0));
    }

    #[test]
    fn smoothing_spreads_a_spike_and_keeps_its_mass() {
        let mut spike = Volume::filled([1, 1, 9], 0.0);
        spike.voxels[4] = 1.0;
        gaussian_smooth(&mut spike, [0.0, 0.0, 1.0]);
        assert!(spike.voxels[4] < 1.0);
        assert!(spike.voxels[3] > 0.0 && (spike.voxels[3] - spike.voxels[5]).abs() < 1e-6);
        assert!((spike.voxels.iter().sum::<f32>() - 1.0).abs() < 1e-5);

        let mut flat = Volume::filled([3, 4, 5], 1.5);
        gaussian_smooth(&mut flat, [0.7, 1.0, 0.4]);
        assert!(flat.voxels.iter().all(|x| (x - 1.5).abs() < 1e-5));
    }

    #[test]
    fn quarter_turn_matches_numpy_convention() {
        let v = ramp([1, 2, 3]);
        let turned = rot90(&v, (1, 2), 1);
        assert_eq!(turned.shape, [1, 3, 2]);
        assert_eq!(turned.voxels, vec![2.0, 5.0, 1.0, 4.0, 0.0, 3.0]);
        assert_eq!(rot90(&turned, (1, 2), 3), v);
    }

    #[test]
    fn four_quarter_turns_restore_each_plane() {
        let v = ramp([2, 3, 4]);
        for plane in [(1, 2), (0, 2), (0, 1)] {
            assert_ne!(rot90(&v, plane, 2), v);
            assert_eq!(rot90(&v, plane, 4), v);
        }
    }

    #[test]
    fn slice_mask_marks_at_least_one_slice() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let mut v = Volume::filled([5, 2, 2], 1.0);
        let mask = mask_slices(&mut v, 0.0, -1.0, &mut rng);
        assert_eq!(mask.iter().filter(|m| **m).count(), 1);
        let masked = mask.iter().position(|m| *m).unwrap();
        assert!(v.voxels[masked * 4..masked * 4 + 4].iter().all(|x| *x == -1.0));
        assert_eq!(v.voxels.iter().filter(|x| **x == 1.0).count(), 16);

        let mut v = Volume::filled([3, 2, 2], 1.0);
        assert!(mask_slices(&mut v, 1.0, 0.0, &mut rng).into_iter().all(|m| m));
    }

    #[test]
    fn grid_means_cover_small_slices() {
        let v = ramp([1, 2, 4]);
        assert_eq!(slice_grid_means(&v, 2), vec![0.5, 2.5, 4.5, 6.5]);
        let tiny = Volume::filled([2, 1, 1], 7.0);
        assert_eq!(slice_grid_means(&tiny, 2), vec![7.0; 8]);
    }
}
