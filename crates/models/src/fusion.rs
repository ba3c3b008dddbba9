//! Encoder + head pairs and the contract shared by both stages.

use crate::config::{ClassificationHeadConfig, FusionEncoderConfig, HeadSpec, PretextHeadConfig};
use crate::encoder::{FusionEncoder, PlaneStacks};
use crate::heads::{ClassificationHead, PretextHead};
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// A shared encoder with a stage-specific head attached.
///
/// Pretraining and fine-tuning models differ only in the head, so encoder
/// weights move between stages through `into_parts`/`from_parts`.
pub trait FusionModel<B: Backend>: Module<B> + Sized {
    type Head: Module<B>;

    fn encoder(&self) -> &FusionEncoder<B>;
    fn head(&self) -> &Self::Head;
    fn into_parts(self) -> (FusionEncoder<B>, Self::Head);
    fn from_parts(encoder: FusionEncoder<B>, head: Self::Head) -> Self;
    fn head_spec(&self) -> HeadSpec;

    fn encoder_config(&self) -> &FusionEncoderConfig {
        &self.encoder().config
    }

    /// Replace the encoder, keeping the current head.
    fn with_encoder(self, encoder: FusionEncoder<B>) -> Self {
        let (_, head) = self.into_parts();
        Self::from_parts(encoder, head)
    }
}

#[derive(Module, Debug)]
pub struct FusionClassifier<B: Backend> {
    encoder: FusionEncoder<B>,
    head: ClassificationHead<B>,
}

impl<B: Backend> FusionClassifier<B> {
    pub fn new(
        encoder: FusionEncoderConfig,
        head: ClassificationHeadConfig,
        device: &B::Device,
    ) -> Self {
        let embed_dim = encoder.embed_dim();
        Self {
            encoder: FusionEncoder::new(encoder, device),
            head: ClassificationHead::new(embed_dim, head, device),
        }
    }

    /// Class logits `[N, num_classes]`.
    pub fn forward(&self, stacks: PlaneStacks<B>) -> Tensor<B, 2> {
        self.head.forward(self.encoder.forward(stacks).embedding)
    }

    pub fn forward_volume(&self, volume: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(PlaneStacks::from_volume(volume))
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }
}

impl<B: Backend> FusionModel<B> for FusionClassifier<B> {
    type Head = ClassificationHead<B>;

    fn encoder(&self) -> &FusionEncoder<B> {
        &self.encoder
    }

    fn head(&self) -> &Self::Head {
        &self.head
    }

    fn into_parts(self) -> (FusionEncoder<B>, Self::Head) {
        (self.encoder, self.head)
    }

    fn from_parts(encoder: FusionEncoder<B>, head: Self::Head) -> Self {
        Self { encoder, head }
    }

    fn head_spec(&self) -> HeadSpec {
        HeadSpec::Classification((*self.head.config).clone())
    }
}

#[derive(Module, Debug)]
pub struct FusionPretext<B: Backend> {
    encoder: FusionEncoder<B>,
    head: PretextHead<B>,
}

impl<B: Backend> FusionPretext<B> {
    pub fn new(encoder: FusionEncoderConfig, head: PretextHeadConfig, device: &B::Device) -> Self {
        let embed_dim = encoder.embed_dim();
        Self {
            encoder: FusionEncoder::new(encoder, device),
            head: PretextHead::new(embed_dim, head, device),
        }
    }

    /// Contrastive projections `[N, proj_dim]`.
    pub fn project(&self, stacks: PlaneStacks<B>) -> Tensor<B, 2> {
        self.head.project(self.encoder.forward(stacks).embedding)
    }

    /// Slice-order logits `[N, 2]`.
    pub fn slice_order_logits(&self, stacks: PlaneStacks<B>) -> Tensor<B, 2> {
        self.head
            .slice_order_logits(self.encoder.forward(stacks).embedding)
    }

    /// Quarter-turn logits `[N, 12]`.
    pub fn rotation_logits(&self, stacks: PlaneStacks<B>) -> Tensor<B, 2> {
        self.head.rotation_logits(self.encoder.forward(stacks).embedding)
    }

    /// Per-axial-slice reconstructions `[N, S_axial, recon_grid²]`, read from
    /// the axial tokens (the first `S_axial` after CLS).
    pub fn reconstruct_axial(&self, stacks: PlaneStacks<B>) -> Tensor<B, 3> {
        let n = stacks.batch_size();
        let s_axial = stacks.slice_counts()[0];
        let tokens = self.encoder.forward(stacks).tokens;
        let d = tokens.dims()[2];
        self.head.reconstruct(tokens.slice([0..n, 0..s_axial, 0..d]))
    }
}

impl<B: Backend> FusionModel<B> for FusionPretext<B> {
    type Head = PretextHead<B>;

    fn encoder(&self) -> &FusionEncoder<B> {
        &self.encoder
    }

    fn head(&self) -> &Self::Head {
        &self.head
    }

    fn into_parts(self) -> (FusionEncoder<B>, Self::Head) {
        (self.encoder, self.head)
    }

    fn from_parts(encoder: FusionEncoder<B>, head: Self::Head) -> Self {
        Self { encoder, head }
    }

    fn head_spec(&self) -> HeadSpec {
        HeadSpec::Pretext((*self.head.config).clone())
    }
}
