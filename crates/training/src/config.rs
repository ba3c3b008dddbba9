//! Run configuration document (JSON by default, TOML by `.toml` extension).
//!
//! Files are parsed into an all-optional mirror first, so a missing required
//! field is reported by name before anything else is allocated.

use crate::checkpoint::{unix_millis, TrainStage};
use crate::trainer::TrainerConfig;
use data_contracts::{write_atomic, IntensityStats};
use models::{FusionEncoderConfig, PretextObjective};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use volume_dataset::BatchConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("missing required config field `{0}`")]
    MissingField(String),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

mod keep_all_as_zero {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(keep: &Option<usize>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(keep.unwrap_or(0) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
        Ok(match usize::deserialize(d)? {
            0 => None,
            n => Some(n),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataList {
    pub train: PathBuf,
    pub val: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub task: String,
    pub project: String,
    pub data_list: DataList,
    pub ckpt_dir: PathBuf,
    /// Pretrained encoder checkpoint used to initialize fine-tuning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_ckpt: Option<PathBuf>,
    pub warmup_epochs: usize,
    pub total_epochs: usize,
    pub base_lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub intensity_stats: IntensityStats,
    pub num_classes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_names: Vec<String>,
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub ckpt_every_epochs: usize,
    /// Periodic checkpoints kept per run; `None` (written as `0`) keeps all.
    #[serde(with = "keep_all_as_zero")]
    pub keep_periodic: Option<usize>,
    pub patience: usize,
    pub min_delta: f64,
    pub strict_loading: bool,
    pub augment: bool,
    pub model: FusionEncoderConfig,
    pub pretext: PretextObjective,
}

#[derive(Debug, Deserialize, Default)]
struct DataListFile {
    train: Option<PathBuf>,
    val: Option<PathBuf>,
    test: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RunConfigFile {
    task: Option<String>,
    project: Option<String>,
    data_list: Option<DataListFile>,
    ckpt_dir: Option<PathBuf>,
    ssl_ckpt: Option<PathBuf>,
    warmup_epochs: Option<usize>,
    total_epochs: Option<usize>,
    base_lr: Option<f64>,
    min_lr: Option<f64>,
    weight_decay: Option<f64>,
    batch_size: Option<usize>,
    intensity_stats: Option<IntensityStats>,
    num_classes: Option<usize>,
    class_names: Option<Vec<String>>,
    seed: Option<u64>,
    run_id: Option<String>,
    ckpt_every_epochs: Option<usize>,
    keep_periodic: Option<usize>,
    patience: Option<usize>,
    min_delta: Option<f64>,
    strict_loading: Option<bool>,
    augment: Option<bool>,
    model: Option<FusionEncoderConfig>,
    pretext: Option<PretextObjective>,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

pub fn default_project(task: &str) -> String {
    format!("Embryo_{task}_Classification")
}

impl RunConfig {
    /// Read, check required fields, apply defaults and validate.
    ///
    /// Relative paths are resolved against the config file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut cfg = Self::parse(&raw, is_toml(path)).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        if let Some(base) = path.parent() {
            cfg.resolve_paths(base);
        }
        Ok(cfg)
    }

    pub fn parse(raw: &str, toml_format: bool) -> Result<Self, ConfigError> {
        let parse_err = |reason: String| ConfigError::Parse {
            path: PathBuf::new(),
            reason,
        };
        let file: RunConfigFile = if toml_format {
            toml::from_str(raw).map_err(|e| parse_err(e.to_string()))?
        } else {
            serde_json::from_str(raw).map_err(|e| parse_err(e.to_string()))?
        };
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RunConfigFile) -> Result<Self, ConfigError> {
        let task = required(file.task, "task")?;
        let data_list = required(file.data_list, "data_list")?;
        let data_list = DataList {
            train: required(data_list.train, "data_list.train")?,
            val: required(data_list.val, "data_list.val")?,
            test: data_list.test,
        };
        Ok(Self {
            project: file.project.unwrap_or_else(|| default_project(&task)),
            task,
            data_list,
            ckpt_dir: required(file.ckpt_dir, "ckpt_dir")?,
            ssl_ckpt: file.ssl_ckpt,
            warmup_epochs: required(file.warmup_epochs, "warmup_epochs")?,
            total_epochs: required(file.total_epochs, "total_epochs")?,
            base_lr: required(file.base_lr, "base_lr")?,
            min_lr: file.min_lr.unwrap_or(0.0),
            weight_decay: file.weight_decay.unwrap_or(1e-2),
            batch_size: file.batch_size.unwrap_or(2),
            intensity_stats: required(file.intensity_stats, "intensity_stats")?,
            num_classes: file.num_classes.unwrap_or(2),
            class_names: file.class_names.unwrap_or_default(),
            seed: file.seed.unwrap_or(42),
            run_id: file.run_id,
            ckpt_every_epochs: file.ckpt_every_epochs.unwrap_or(1),
            keep_periodic: match file.keep_periodic {
                None => Some(3),
                Some(0) => None,
                Some(n) => Some(n),
            },
            patience: file.patience.unwrap_or(0),
            min_delta: file.min_delta.unwrap_or(0.0),
            strict_loading: file.strict_loading.unwrap_or(false),
            augment: file.augment.unwrap_or(true),
            model: file.model.unwrap_or_default(),
            pretext: file.pretext.unwrap_or_default(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task.trim().is_empty() {
            return Err(invalid("task", "must not be empty"));
        }
        if self.total_epochs == 0 {
            return Err(invalid("total_epochs", "must be > 0"));
        }
        if self.warmup_epochs > self.total_epochs {
            return Err(invalid(
                "warmup_epochs",
                format!("{} exceeds total_epochs {}", self.warmup_epochs, self.total_epochs),
            ));
        }
        if !self.base_lr.is_finite() || self.base_lr <= 0.0 {
            return Err(invalid("base_lr", format!("must be finite and > 0 (got {})", self.base_lr)));
        }
        if !self.min_lr.is_finite() || self.min_lr < 0.0 || self.min_lr > self.base_lr {
            return Err(invalid("min_lr", format!("must be within [0, base_lr] (got {})", self.min_lr)));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(invalid("weight_decay", format!("must be finite and >= 0 (got {})", self.weight_decay)));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        self.intensity_stats
            .validate()
            .map_err(|e| invalid("intensity_stats", e.to_string()))?;
        if self.num_classes < 2 {
            return Err(invalid("num_classes", format!("must be >= 2 (got {})", self.num_classes)));
        }
        if !self.class_names.is_empty() && self.class_names.len() != self.num_classes {
            return Err(invalid(
                "class_names",
                format!("has {} names for {} classes", self.class_names.len(), self.num_classes),
            ));
        }
        if self.keep_periodic == Some(0) {
            return Err(invalid("keep_periodic", "must be >= 1 when set"));
        }
        if !self.min_delta.is_finite() || self.min_delta < 0.0 {
            return Err(invalid("min_delta", format!("must be finite and >= 0 (got {})", self.min_delta)));
        }
        if let Some(run_id) = &self.run_id {
            if run_id.trim().is_empty() || run_id.contains(['/', '\\']) {
                return Err(invalid("run_id", format!("`{run_id}` is not a valid directory name")));
            }
        }
        self.model.validate().map_err(|e| invalid("model", e.to_string()))?;
        match self.pretext {
            PretextObjective::Contrastive { temperature } if !temperature.is_finite() || temperature <= 0.0 => {
                return Err(invalid("pretext.temperature", format!("must be > 0 (got {temperature})")));
            }
            PretextObjective::Masked { mask_ratio } if !(mask_ratio > 0.0 && mask_ratio <= 1.0) => {
                return Err(invalid("pretext.mask_ratio", format!("must be within (0, 1] (got {mask_ratio})")));
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        resolve(base, &mut self.data_list.train);
        resolve(base, &mut self.data_list.val);
        if let Some(test) = self.data_list.test.as_mut() {
            resolve(base, test);
        }
        resolve(base, &mut self.ckpt_dir);
        if let Some(ssl) = self.ssl_ckpt.as_mut() {
            resolve(base, ssl);
        }
    }

    /// Serialize to JSON or TOML (by extension) and write atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };
        write_atomic(path, text.as_bytes()).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Configured run id, or `<task>-<unix_millis>`.
    pub fn resolved_run_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.task, unix_millis()))
    }

    pub fn trainer_config(&self, stage: TrainStage, run_id: String) -> TrainerConfig {
        TrainerConfig {
            run_id,
            stage,
            warmup_epochs: self.warmup_epochs,
            total_epochs: self.total_epochs,
            base_lr: self.base_lr,
            lr_floor: self.min_lr,
            ckpt_every_epochs: self.ckpt_every_epochs,
            patience: self.patience,
            min_delta: self.min_delta,
            intensity_stats: Some(self.intensity_stats),
        }
    }

    pub fn train_batches(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            shuffle: true,
            seed: self.seed,
            drop_last: false,
            strict: self.strict_loading,
        }
    }

    pub fn eval_batches(&self) -> BatchConfig {
        BatchConfig::eval(self.batch_size, self.strict_loading)
    }
}
