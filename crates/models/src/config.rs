use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ModelConfigError {
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("d_model {d_model} is not divisible by n_heads {n_heads}")]
    HeadsDoNotDivide { d_model: usize, n_heads: usize },
    #[error("dropout must be in [0, 1) (got {0})")]
    Dropout(f64),
    #[error("tower_channels must list at least one conv layer")]
    NoTowerLayers,
}

/// Architecture of the fusion encoder. Persisted in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionEncoderConfig {
    /// Token width; also the embedding width heads attach to.
    pub d_model: usize,
    /// Output channels of each stride-2 conv layer in a slice tower.
    pub tower_channels: Vec<usize>,
    pub n_heads: usize,
    pub n_layers: usize,
    /// Feed-forward width as a multiple of `d_model`.
    pub ff_mult: usize,
    pub dropout: f64,
}

impl Default for FusionEncoderConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            tower_channels: vec![16, 32, 64, 128],
            n_heads: 8,
            n_layers: 4,
            ff_mult: 4,
            dropout: 0.1,
        }
    }
}

impl FusionEncoderConfig {
    /// Small config for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            d_model: 16,
            tower_channels: vec![4, 8],
            n_heads: 2,
            n_layers: 1,
            ff_mult: 2,
            dropout: 0.0,
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.d_model
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn validate(&self) -> Result<(), ModelConfigError> {
        for (field, value) in [
            ("d_model", self.d_model),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
            ("ff_mult", self.ff_mult),
        ] {
            if value == 0 {
                return Err(ModelConfigError::Zero { field });
            }
        }
        if self.tower_channels.is_empty() {
            return Err(ModelConfigError::NoTowerLayers);
        }
        if self.tower_channels.contains(&0) {
            return Err(ModelConfigError::Zero {
                field: "tower_channels",
            });
        }
        if self.d_model % self.n_heads != 0 {
            return Err(ModelConfigError::HeadsDoNotDivide {
                d_model: self.d_model,
                n_heads: self.n_heads,
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelConfigError::Dropout(self.dropout));
        }
        Ok(())
    }

    /// First architecture field that differs from `expected`, as
    /// `(field, stored, expected)`. Dropout is not part of the architecture.
    pub fn architecture_diff(&self, expected: &Self) -> Option<(&'static str, String, String)> {
        let pairs = [
            ("d_model", self.d_model, expected.d_model),
            ("n_heads", self.n_heads, expected.n_heads),
            ("n_layers", self.n_layers, expected.n_layers),
            ("ff_mult", self.ff_mult, expected.ff_mult),
        ];
        for (field, stored, want) in pairs {
            if stored != want {
                return Some((field, stored.to_string(), want.to_string()));
            }
        }
        if self.tower_channels != expected.tower_channels {
            return Some((
                "tower_channels",
                format!("{:?}", self.tower_channels),
                format!("{:?}", expected.tower_channels),
            ));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationHeadConfig {
    pub num_classes: usize,
    /// Optional hidden layer; `None` is a single linear map from the CLS embedding.
    pub hidden: Option<usize>,
    pub dropout: f64,
}

impl Default for ClassificationHeadConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            hidden: None,
            dropout: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretextHeadConfig {
    pub hidden: usize,
    pub proj_dim: usize,
    /// Masked-slice targets are `recon_grid x recon_grid` cell means.
    pub recon_grid: usize,
}

impl Default for PretextHeadConfig {
    fn default() -> Self {
        Self {
            hidden: 256,
            proj_dim: 128,
            recon_grid: 4,
        }
    }
}

/// Head attached to the encoder, recorded alongside encoder weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadSpec {
    Classification(ClassificationHeadConfig),
    Pretext(PretextHeadConfig),
}

impl HeadSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            HeadSpec::Classification(_) => "classification",
            HeadSpec::Pretext(_) => "pretext",
        }
    }
}

/// Self-supervised objective driving pretraining.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PretextObjective {
    /// NT-Xent between two augmented views of each volume.
    Contrastive { temperature: f64 },
    /// Predict whether a volume's axial slices were shuffled.
    SliceOrder,
    /// Predict which of 12 quarter-turns (`axis * 4 + k`) was applied.
    Rotation,
    /// Blank a random subset of axial slices and regress their coarse
    /// content from the encoder's per-slice tokens.
    Masked {
        #[serde(default = "default_mask_ratio")]
        mask_ratio: f64,
    },
}

fn default_mask_ratio() -> f64 {
    0.3
}

impl PretextObjective {
    pub fn name(&self) -> &'static str {
        match self {
            PretextObjective::Contrastive { .. } => "contrastive",
            PretextObjective::SliceOrder => "slice_order",
            PretextObjective::Rotation => "rotation",
            PretextObjective::Masked { .. } => "masked",
        }
    }
}

impl Default for PretextObjective {
    fn default() -> Self {
        PretextObjective::Contrastive { temperature: 0.1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        FusionEncoderConfig::default().validate().unwrap();
        FusionEncoderConfig::tiny().validate().unwrap();
    }

    #[test]
    fn heads_must_divide_width() {
        let cfg = FusionEncoderConfig {
            n_heads: 3,
            ..FusionEncoderConfig::tiny()
        };
        assert_eq!(
            cfg.validate(),
            Err(ModelConfigError::HeadsDoNotDivide {
                d_model: 16,
                n_heads: 3
            })
        );
    }

    #[test]
    fn dropout_is_not_architecture() {
        let a = FusionEncoderConfig::tiny();
        let b = a.clone().with_dropout(0.3);
        assert_eq!(a.architecture_diff(&b), None);
        let c = FusionEncoderConfig {
            d_model: 32,
            ..a.clone()
        };
        assert_eq!(
            a.architecture_diff(&c),
            Some(("d_model", "16".into(), "32".into()))
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: FusionEncoderConfig = serde_json::from_str(r#"{"d_model": 64, "n_heads": 4}"#).unwrap();
        assert_eq!(cfg.d_model, 64);
        assert_eq!(cfg.n_layers, FusionEncoderConfig::default().n_layers);
    }

    #[test]
    fn pretext_objectives_read_from_tagged_json() {
        let masked: PretextObjective = serde_json::from_str(r#"{"kind":"masked"}"#).unwrap();
        assert_eq!(masked, PretextObjective::Masked { mask_ratio: 0.3 });
        let rotation: PretextObjective = serde_json::from_str(r#"{"kind":"rotation"}"#).unwrap();
        assert_eq!(rotation.name(), "rotation");
        let head: PretextHeadConfig = serde_json::from_str(r#"{"hidden":8,"proj_dim":4}"#).unwrap();
        assert_eq!(head.recon_grid, 4);
    }
}
