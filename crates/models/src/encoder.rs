//! Three-plane fusion encoder.
//!
//! Shapes:
//! - Plane stacks: `[N, S_p, H_p, W_p]`, one per plane; slice counts and in-plane
//!   sizes may differ between planes.
//! - Tokens: `[N, 1 + S_axial + S_sagittal + S_coronal, d_model]`, CLS first.
//! - Embedding: `[N, d_model]`, the CLS token after the final norm.

use crate::config::FusionEncoderConfig;
use burn::module::{Ignored, Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use data_contracts::Plane;
use volume_dataset::{stack_plane, DatasetResult, Sample};

/// Per-plane slice stacks of one batch.
#[derive(Debug, Clone)]
pub struct PlaneStacks<B: Backend> {
    pub axial: Tensor<B, 4>,
    pub sagittal: Tensor<B, 4>,
    pub coronal: Tensor<B, 4>,
}

impl<B: Backend> PlaneStacks<B> {
    /// Reslice a dense volume batch `[N, D, H, W]`: axial slices along D,
    /// coronal along H (`[N, H, D, W]`), sagittal along W (`[N, W, D, H]`).
    pub fn from_volume(volume: Tensor<B, 4>) -> Self {
        Self {
            coronal: volume.clone().permute([0, 2, 1, 3]),
            sagittal: volume.clone().permute([0, 3, 1, 2]),
            axial: volume,
        }
    }

    /// Stack host samples plane by plane.
    pub fn from_samples(samples: &[Sample], device: &B::Device) -> DatasetResult<Self> {
        let to_tensor = |plane: Plane| -> DatasetResult<Tensor<B, 4>> {
            let batch = stack_plane(samples, plane)?;
            Ok(Tensor::from_data(TensorData::new(batch.data, batch.shape), device))
        };
        Ok(Self {
            axial: to_tensor(Plane::Axial)?,
            sagittal: to_tensor(Plane::Sagittal)?,
            coronal: to_tensor(Plane::Coronal)?,
        })
    }

    pub fn get(&self, plane: Plane) -> &Tensor<B, 4> {
        match plane {
            Plane::Axial => &self.axial,
            Plane::Sagittal => &self.sagittal,
            Plane::Coronal => &self.coronal,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.axial.dims()[0]
    }

    pub fn slice_counts(&self) -> [usize; 3] {
        [
            self.axial.dims()[1],
            self.sagittal.dims()[1],
            self.coronal.dims()[1],
        ]
    }
}

/// Shared 2D CNN applied to every slice of one plane.
#[derive(Module, Debug)]
pub struct SliceTower<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    proj: Linear<B>,
}

impl<B: Backend> SliceTower<B> {
    pub fn new(channels: &[usize], d_model: usize, device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(channels.len());
        let mut in_ch = 1;
        for &out_ch in channels {
            convs.push(
                Conv2dConfig::new([in_ch, out_ch], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            in_ch = out_ch;
        }
        Self {
            convs,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            proj: LinearConfig::new(in_ch, d_model).init(device),
        }
    }

    /// `[N, S, H, W]` → `[N, S, d_model]`; slices are folded into the batch axis.
    pub fn forward(&self, stack: Tensor<B, 4>) -> Tensor<B, 3> {
        let [n, s, h, w] = stack.dims();
        let mut x = stack.reshape([n * s, 1, h, w]);
        for conv in &self.convs {
            x = relu(conv.forward(x));
        }
        let channels = x.dims()[1];
        let pooled = self.pool.forward(x).reshape([n * s, channels]);
        let tokens = self.proj.forward(pooled);
        let d_model = tokens.dims()[1];
        tokens.reshape([n, s, d_model])
    }
}

/// Output of [`FusionEncoder::forward`].
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    /// CLS embedding, `[N, d_model]`.
    pub embedding: Tensor<B, 2>,
    /// Per-slice tokens after fusion (CLS excluded), `[N, L, d_model]`.
    pub tokens: Tensor<B, 3>,
}

#[derive(Module, Debug)]
pub struct FusionEncoder<B: Backend> {
    axial: SliceTower<B>,
    sagittal: SliceTower<B>,
    coronal: SliceTower<B>,
    cls: Param<Tensor<B, 3>>,
    plane_embedding: Param<Tensor<B, 2>>,
    fusion: TransformerEncoder<B>,
    norm: LayerNorm<B>,
    pub config: Ignored<FusionEncoderConfig>,
}

impl<B: Backend> FusionEncoder<B> {
    pub fn new(config: FusionEncoderConfig, device: &B::Device) -> Self {
        let d = config.d_model;
        let tower = |device: &B::Device| SliceTower::new(&config.tower_channels, d, device);
        let init = Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        };
        Self {
            axial: tower(device),
            sagittal: tower(device),
            coronal: tower(device),
            cls: init.init([1, 1, d], device),
            plane_embedding: init.init([3, d], device),
            fusion: TransformerEncoderConfig::new(d, d * config.ff_mult, config.n_heads, config.n_layers)
                .with_dropout(config.dropout)
                .with_norm_first(true)
                .init(device),
            norm: LayerNormConfig::new(d).init(device),
            config: Ignored(config),
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.config.d_model
    }

    pub fn device(&self) -> B::Device {
        self.plane_embedding.val().device()
    }

    fn tower(&self, plane: Plane) -> &SliceTower<B> {
        match plane {
            Plane::Axial => &self.axial,
            Plane::Sagittal => &self.sagittal,
            Plane::Coronal => &self.coronal,
        }
    }

    pub fn forward(&self, stacks: PlaneStacks<B>) -> EncoderOutput<B> {
        let n = stacks.batch_size();
        let d = self.config.d_model;
        let device = self.device();

        let mut sequence = vec![self.cls.val().repeat_dim(0, n)];
        for plane in Plane::ALL {
            let tokens = self.tower(plane).forward(stacks.get(plane).clone());
            let s = tokens.dims()[1];
            let plane_bias = self
                .plane_embedding
                .val()
                .slice([plane.index()..plane.index() + 1, 0..d])
                .reshape([1, 1, d]);
            let positions = sinusoidal_positions::<B>(s, d, &device).reshape([1, s, d]);
            sequence.push(tokens + plane_bias + positions);
        }
        let x = Tensor::cat(sequence, 1);
        let x = self.fusion.forward(TransformerEncoderInput::new(x));
        let x = self.norm.forward(x);
        let len = x.dims()[1];
        let embedding = x.clone().slice([0..n, 0..1, 0..d]).reshape([n, d]);
        let tokens = x.slice([0..n, 1..len, 0..d]);
        EncoderOutput { embedding, tokens }
    }

    /// Convenience for dense volume batches `[N, D, H, W]`.
    pub fn forward_volume(&self, volume: Tensor<B, 4>) -> EncoderOutput<B> {
        self.forward(PlaneStacks::from_volume(volume))
    }
}

/// Standard sine/cosine position table `[len, d]`, computed for the actual length.
pub fn sinusoidal_positions<B: Backend>(len: usize, d: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut table = Vec::with_capacity(len * d);
    for pos in 0..len {
        for i in 0..d {
            let exponent = (2 * (i / 2)) as f64 / d as f64;
            let angle = pos as f64 / 10_000f64.powf(exponent);
            let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            table.push(value as f32);
        }
    }
    Tensor::from_data(TensorData::new(table, [len, d]), device)
}
