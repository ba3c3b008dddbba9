//! Heads that attach to the encoder's CLS embedding.

use crate::config::{ClassificationHeadConfig, PretextHeadConfig};
use burn::module::{Ignored, Module};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::{gelu, relu};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// CLS embedding → class logits; a single linear layer unless `hidden` is set.
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    hidden: Option<Linear<B>>,
    dropout: Dropout,
    out: Linear<B>,
    pub config: Ignored<ClassificationHeadConfig>,
}

impl<B: Backend> ClassificationHead<B> {
    pub fn new(embed_dim: usize, config: ClassificationHeadConfig, device: &B::Device) -> Self {
        let (hidden, out_in) = match config.hidden {
            Some(width) => (Some(LinearConfig::new(embed_dim, width).init(device)), width),
            None => (None, embed_dim),
        };
        Self {
            hidden,
            dropout: DropoutConfig::new(config.dropout).init(),
            out: LinearConfig::new(out_in, config.num_classes.max(1)).init(device),
            config: Ignored(config),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// `[N, d_model]` → `[N, num_classes]`.
    pub fn forward(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = self.dropout.forward(embedding);
        if let Some(hidden) = &self.hidden {
            x = relu(hidden.forward(x));
        }
        self.out.forward(x)
    }
}

/// Quarter-turn classes: three rotation planes times four turns.
pub const ROTATION_CLASSES: usize = 12;

/// Pretext heads: a contrastive projection MLP over the CLS embedding, slice-order
/// and rotation classifiers over the same embedding, and a per-slice
/// reconstruction layer over the encoder tokens.
#[derive(Module, Debug)]
pub struct PretextHead<B: Backend> {
    proj_in: Linear<B>,
    proj_out: Linear<B>,
    order: Linear<B>,
    rotation: Linear<B>,
    reconstruct: Linear<B>,
    pub config: Ignored<PretextHeadConfig>,
}

impl<B: Backend> PretextHead<B> {
    pub fn new(embed_dim: usize, config: PretextHeadConfig, device: &B::Device) -> Self {
        let cells = config.recon_grid.max(1).pow(2);
        Self {
            proj_in: LinearConfig::new(embed_dim, config.hidden).init(device),
            proj_out: LinearConfig::new(config.hidden, config.proj_dim).init(device),
            order: LinearConfig::new(embed_dim, 2).init(device),
            rotation: LinearConfig::new(embed_dim, ROTATION_CLASSES).init(device),
            reconstruct: LinearConfig::new(embed_dim, cells).init(device),
            config: Ignored(config),
        }
    }

    /// `[N, d_model]` → `[N, proj_dim]`, not normalized.
    pub fn project(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        self.proj_out.forward(gelu(self.proj_in.forward(embedding)))
    }

    /// `[N, d_model]` → `[N, 2]` logits for intact (0) vs shuffled (1).
    pub fn slice_order_logits(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        self.order.forward(embedding)
    }

    /// `[N, d_model]` → `[N, 12]`.
    pub fn rotation_logits(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        self.rotation.forward(embedding)
    }

    /// `[N, S, d_model]` slice tokens → `[N, S, recon_grid²]`.
    pub fn reconstruct(&self, tokens: Tensor<B, 3>) -> Tensor<B, 3> {
        self.reconstruct.forward(tokens)
    }
}
