//! Burn models for the embryo CT fusion classifier.
//!
//! This crate defines the network used in both training stages:
//! - `FusionEncoder`: one 2D CNN tower per plane (axial/sagittal/coronal), whose
//!   per-slice tokens are fused by a Transformer encoder behind a CLS token.
//! - `ClassificationHead`: CLS embedding to class logits (fine-tuning).
//! - `PretextHead`: projection MLP and slice-order classifier (pretraining).
//!
//! These are pure Burn Modules. Losses, optimizers and checkpoints live in the
//! `training` crate.

pub mod config;
pub mod encoder;
pub mod fusion;
pub mod heads;

pub use config::{
    ClassificationHeadConfig, FusionEncoderConfig, HeadSpec, ModelConfigError, PretextHeadConfig,
    PretextObjective,
};
pub use encoder::{sinusoidal_positions, EncoderOutput, FusionEncoder, PlaneStacks, SliceTower};
pub use fusion::{FusionClassifier, FusionModel, FusionPretext};
pub use heads::{ClassificationHead, PretextHead, ROTATION_CLASSES};

pub mod prelude {
    pub use super::{
        ClassificationHeadConfig, FusionClassifier, FusionEncoder, FusionEncoderConfig,
        FusionModel, FusionPretext, PlaneStacks, PretextHeadConfig,
    };
}
