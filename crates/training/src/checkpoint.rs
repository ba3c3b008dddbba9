//! Checkpoint container, on-disk layout and model restore.
//!
//! Container layout (all integers little-endian):
//!
//! ```text
//! b"EMBRCKPT" | u32 format version
//! u64 len | meta JSON
//! u64 len | encoder record   (BinBytesRecorder, full precision)
//! u64 len | head record      (empty = absent)
//! u64 len | optimizer record (empty = absent)
//! sha256 of everything above
//! ```

use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use data_contracts::{write_atomic, IntensityStats};
use models::{FusionClassifier, FusionEncoder, FusionEncoderConfig, FusionModel, HeadSpec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"EMBRCKPT";
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const CHECKPOINT_EXTENSION: &str = "ckpt";
pub const BEST_FILE: &str = "best.ckpt";
pub const RUN_META_FILE: &str = "run.json";

const DIGEST_LEN: usize = 32;

type ModuleRecorder = BinBytesRecorder<FullPrecisionSettings>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint architecture mismatch on {field}: stored {stored}, expected {expected}")]
    ShapeMismatch {
        field: String,
        stored: String,
        expected: String,
    },
    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
}

impl CheckpointError {
    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Which training stage a checkpoint belongs to; decides its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStage {
    Pretrain,
    Finetune,
}

impl TrainStage {
    pub fn dir_name(self) -> &'static str {
        match self {
            TrainStage::Pretrain => "ssl_runs",
            TrainStage::Finetune => "runs",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrainStage::Pretrain => "pretrain",
            TrainStage::Finetune => "finetune",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTag {
    Best,
    Periodic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub run_id: String,
    pub stage: TrainStage,
    pub tag: CheckpointTag,
    /// Last completed epoch (0-based).
    pub epoch: usize,
    /// Global optimizer steps taken so far.
    pub step: usize,
    pub steps_per_epoch: usize,
    #[serde(default)]
    pub score: Option<f64>,
    pub encoder_config: FusionEncoderConfig,
    #[serde(default)]
    pub head: Option<HeadSpec>,
    #[serde(default)]
    pub intensity_stats: Option<IntensityStats>,
    #[serde(default)]
    pub created_unix_ms: u64,
}

/// Serialized checkpoint payload. Empty byte sections mean "absent".
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub encoder: Vec<u8>,
    pub head: Vec<u8>,
    pub optimizer: Vec<u8>,
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn encode_module<B: Backend, M: Module<B>>(
    module: M,
    what: &'static str,
) -> Result<Vec<u8>, CheckpointError> {
    Recorder::<B>::record(&ModuleRecorder::default(), module.into_record(), ()).map_err(|e| {
        CheckpointError::Encode {
            what,
            reason: e.to_string(),
        }
    })
}

pub fn decode_module<B: Backend, M: Module<B>>(
    template: M,
    bytes: &[u8],
    what: &str,
    path: &Path,
    device: &B::Device,
) -> Result<M, CheckpointError> {
    if bytes.is_empty() {
        return Err(CheckpointError::corrupt(path, format!("{what} section is empty")));
    }
    let record: M::Record = Recorder::<B>::load(&ModuleRecorder::default(), bytes.to_vec(), device)
        .map_err(|e| CheckpointError::corrupt(path, format!("{what} record: {e}")))?;
    Ok(template.load_record(record))
}

pub fn encode_optimizer<B, M, O>(optim: &O) -> Result<Vec<u8>, CheckpointError>
where
    B: AutodiffBackend,
    M: burn::module::AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    Recorder::<B>::record(&ModuleRecorder::default(), optim.to_record(), ()).map_err(|e| {
        CheckpointError::Encode {
            what: "optimizer",
            reason: e.to_string(),
        }
    })
}

pub fn decode_optimizer<B, M, O>(
    optim: O,
    bytes: &[u8],
    path: &Path,
    device: &B::Device,
) -> Result<O, CheckpointError>
where
    B: AutodiffBackend,
    M: burn::module::AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let record: O::Record = Recorder::<B>::load(&ModuleRecorder::default(), bytes.to_vec(), device)
        .map_err(|e| CheckpointError::corrupt(path, format!("optimizer record: {e}")))?;
    Ok(optim.load_record(record))
}

impl Checkpoint {
    /// Snapshot `model`'s encoder and head weights.
    pub fn from_model<B: Backend, M: FusionModel<B>>(
        meta: CheckpointMeta,
        model: &M,
        optimizer: Vec<u8>,
    ) -> Result<Self, CheckpointError> {
        let (encoder, head) = model.clone().into_parts();
        Ok(Self {
            meta,
            encoder: encode_module::<B, _>(encoder, "encoder")?,
            head: encode_module::<B, _>(head, "head")?,
            optimizer,
        })
    }

    /// Fail with `ShapeMismatch` if the stored encoder differs from `expected`.
    pub fn verify_encoder(&self, expected: &FusionEncoderConfig) -> Result<(), CheckpointError> {
        match self.meta.encoder_config.architecture_diff(expected) {
            Some((field, stored, expected)) => Err(CheckpointError::ShapeMismatch {
                field: format!("encoder.{field}"),
                stored,
                expected,
            }),
            None => Ok(()),
        }
    }

    pub fn verify_head(&self, expected: &HeadSpec) -> Result<(), CheckpointError> {
        let Some(stored) = &self.meta.head else {
            return Err(CheckpointError::ShapeMismatch {
                field: "head".into(),
                stored: "none".into(),
                expected: expected.kind().into(),
            });
        };
        if stored.kind() != expected.kind() {
            return Err(CheckpointError::ShapeMismatch {
                field: "head.kind".into(),
                stored: stored.kind().into(),
                expected: expected.kind().into(),
            });
        }
        let diff = match (stored, expected) {
            (HeadSpec::Classification(s), HeadSpec::Classification(e)) => {
                if s.num_classes != e.num_classes {
                    Some(("num_classes", s.num_classes.to_string(), e.num_classes.to_string()))
                } else if s.hidden != e.hidden {
                    Some(("hidden", format!("{:?}", s.hidden), format!("{:?}", e.hidden)))
                } else {
                    None
                }
            }
            (HeadSpec::Pretext(s), HeadSpec::Pretext(e)) => {
                if s.hidden != e.hidden {
                    Some(("hidden", s.hidden.to_string(), e.hidden.to_string()))
                } else if s.proj_dim != e.proj_dim {
                    Some(("proj_dim", s.proj_dim.to_string(), e.proj_dim.to_string()))
                } else if s.recon_grid != e.recon_grid {
                    Some(("recon_grid", s.recon_grid.to_string(), e.recon_grid.to_string()))
                } else {
                    None
                }
            }
            _ => None,
        };
        match diff {
            Some((field, stored, expected)) => Err(CheckpointError::ShapeMismatch {
                field: format!("head.{field}"),
                stored,
                expected,
            }),
            None => Ok(()),
        }
    }

    /// Load encoder weights only, after checking the architecture.
    pub fn restore_encoder<B: Backend>(
        &self,
        template: FusionEncoder<B>,
        path: &Path,
        device: &B::Device,
    ) -> Result<FusionEncoder<B>, CheckpointError> {
        self.verify_encoder(&template.config)?;
        decode_module(template, &self.encoder, "encoder", path, device)
    }

    /// Load encoder and head weights into `template`, after checking both shapes.
    pub fn restore_model<B: Backend, M: FusionModel<B>>(
        &self,
        template: M,
        path: &Path,
        device: &B::Device,
    ) -> Result<M, CheckpointError> {
        self.verify_encoder(template.encoder_config())?;
        self.verify_head(&template.head_spec())?;
        let (encoder, head) = template.into_parts();
        let encoder = decode_module(encoder, &self.encoder, "encoder", path, device)?;
        let head = decode_module(head, &self.head, "head", path, device)?;
        Ok(M::from_parts(encoder, head))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CheckpointError> {
        let meta = serde_json::to_vec(&self.meta).map_err(|e| CheckpointError::Encode {
            what: "meta",
            reason: e.to_string(),
        })?;
        let sections: [&[u8]; 4] = [&meta, &self.encoder, &self.head, &self.optimizer];
        let body_len: usize = sections.iter().map(|s| s.len() + 8).sum();
        let mut out = Vec::with_capacity(12 + body_len + DIGEST_LEN);
        out.extend_from_slice(CHECKPOINT_MAGIC);
        out.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
        for section in sections {
            out.extend_from_slice(&(section.len() as u64).to_le_bytes());
            out.extend_from_slice(section);
        }
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        Ok(out)
    }

    /// Parse a container; `path` is only used in error messages.
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self, CheckpointError> {
        if bytes.len() < CHECKPOINT_MAGIC.len() + 4 + DIGEST_LEN {
            return Err(CheckpointError::corrupt(path, "file too short"));
        }
        if &bytes[..8] != CHECKPOINT_MAGIC {
            return Err(CheckpointError::corrupt(path, "bad magic"));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(CheckpointError::corrupt(path, "checksum mismatch"));
        }
        let version = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
        if version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::corrupt(
                path,
                format!("unsupported format version {version}"),
            ));
        }
        let mut cursor = 12usize;
        let mut sections: Vec<Vec<u8>> = Vec::with_capacity(4);
        for name in ["meta", "encoder", "head", "optimizer"] {
            let len_bytes: [u8; 8] = body
                .get(cursor..cursor + 8)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| CheckpointError::corrupt(path, format!("{name} length truncated")))?;
            cursor += 8;
            let len = u64::from_le_bytes(len_bytes) as usize;
            let section = body
                .get(cursor..cursor.saturating_add(len))
                .ok_or_else(|| CheckpointError::corrupt(path, format!("{name} section truncated")))?;
            sections.push(section.to_vec());
            cursor += len;
        }
        if cursor != body.len() {
            return Err(CheckpointError::corrupt(path, "trailing bytes after sections"));
        }
        let optimizer = sections.pop().unwrap_or_default();
        let head = sections.pop().unwrap_or_default();
        let encoder = sections.pop().unwrap_or_default();
        let meta_bytes = sections.pop().unwrap_or_default();
        let meta: CheckpointMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| CheckpointError::corrupt(path, format!("meta: {e}")))?;
        Ok(Self {
            meta,
            encoder,
            head,
            optimizer,
        })
    }
}

/// Run metadata rewritten after every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub stage: TrainStage,
    pub epoch: usize,
    pub step: usize,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub best_score: Option<f64>,
    #[serde(default)]
    pub best_epoch: Option<usize>,
    pub updated_unix_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    keep_periodic: Option<usize>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_periodic: Some(3),
        }
    }

    /// Keep at most `keep` periodic checkpoints per run (`None` keeps all).
    pub fn with_keep_periodic(mut self, keep: Option<usize>) -> Self {
        self.keep_periodic = keep;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str, stage: TrainStage) -> PathBuf {
        self.root.join(stage.dir_name()).join(run_id)
    }

    pub fn best_path(&self, run_id: &str, stage: TrainStage) -> PathBuf {
        self.run_dir(run_id, stage).join(BEST_FILE)
    }

    pub fn periodic_path(&self, run_id: &str, stage: TrainStage, epoch: usize) -> PathBuf {
        self.run_dir(run_id, stage)
            .join(format!("epoch_{epoch:04}.{CHECKPOINT_EXTENSION}"))
    }

    /// Atomically write `checkpoint` under its run directory and return the final path.
    pub fn save(
        &self,
        run_id: &str,
        stage: TrainStage,
        checkpoint: &Checkpoint,
    ) -> Result<PathBuf, CheckpointError> {
        let path = match checkpoint.meta.tag {
            CheckpointTag::Best => self.best_path(run_id, stage),
            CheckpointTag::Periodic => self.periodic_path(run_id, stage, checkpoint.meta.epoch),
        };
        let bytes = checkpoint.encode()?;
        write_atomic(&path, &bytes).map_err(|e| CheckpointError::Io {
            path: path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "checkpoint written");
        if checkpoint.meta.tag == CheckpointTag::Periodic {
            self.prune(run_id, stage);
        }
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let bytes = fs::read(path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Checkpoint::decode(&bytes, path)
    }

    /// Periodic checkpoints of a run as `(epoch, path)`, oldest first.
    pub fn list_periodic(&self, run_id: &str, stage: TrainStage) -> Vec<(usize, PathBuf)> {
        let Ok(entries) = fs::read_dir(self.run_dir(run_id, stage)) else {
            return Vec::new();
        };
        let mut found: Vec<(usize, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                let name = path.file_name()?.to_str()?;
                let epoch = name
                    .strip_prefix("epoch_")?
                    .strip_suffix(&format!(".{CHECKPOINT_EXTENSION}"))?
                    .parse()
                    .ok()?;
                Some((epoch, path))
            })
            .collect();
        found.sort();
        found
    }

    pub fn latest_periodic(&self, run_id: &str, stage: TrainStage) -> Option<PathBuf> {
        self.list_periodic(run_id, stage).pop().map(|(_, p)| p)
    }

    fn prune(&self, run_id: &str, stage: TrainStage) {
        let Some(keep) = self.keep_periodic else {
            return;
        };
        let periodic = self.list_periodic(run_id, stage);
        let excess = periodic.len().saturating_sub(keep);
        for (_, path) in periodic.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to prune checkpoint");
            }
        }
    }

    pub fn write_run_meta(&self, meta: &RunMeta) -> Result<PathBuf, CheckpointError> {
        let path = self.run_dir(&meta.run_id, meta.stage).join(RUN_META_FILE);
        let json = serde_json::to_vec_pretty(meta).map_err(|e| CheckpointError::Encode {
            what: "run metadata",
            reason: e.to_string(),
        })?;
        write_atomic(&path, &json).map_err(|e| CheckpointError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    pub fn read_run_meta(&self, run_id: &str, stage: TrainStage) -> Result<RunMeta, CheckpointError> {
        let path = self.run_dir(run_id, stage).join(RUN_META_FILE);
        let bytes = fs::read(&path).map_err(|e| CheckpointError::Io {
            path: path.clone(),
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| CheckpointError::corrupt(&path, e.to_string()))
    }
}

/// Load a fine-tuned classifier for inference, with dropout disabled.
///
/// The template is built from the checkpoint's own meta, so any stored
/// classification head loads; a pretext checkpoint is a `ShapeMismatch`.
pub fn load_classifier<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(FusionClassifier<B>, Checkpoint), CheckpointError> {
    let checkpoint = CheckpointStore::load(path)?;
    let head = match &checkpoint.meta.head {
        Some(HeadSpec::Classification(head)) => head.clone(),
        other => {
            return Err(CheckpointError::ShapeMismatch {
                field: "head.kind".into(),
                stored: other.as_ref().map_or("none", HeadSpec::kind).into(),
                expected: "classification".into(),
            })
        }
    };
    let template = FusionClassifier::new(
        checkpoint.meta.encoder_config.clone().with_dropout(0.0),
        models::ClassificationHeadConfig {
            dropout: 0.0,
            ..head
        },
        device,
    );
    let model = checkpoint.restore_model(template, path, device)?;
    Ok((model, checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(tag: CheckpointTag, epoch: usize) -> CheckpointMeta {
        CheckpointMeta {
            format_version: CHECKPOINT_FORMAT_VERSION,
            run_id: "r1".into(),
            stage: TrainStage::Finetune,
            tag,
            epoch,
            step: epoch * 10,
            steps_per_epoch: 10,
            score: Some(0.5),
            encoder_config: FusionEncoderConfig::tiny(),
            head: None,
            intensity_stats: Some(IntensityStats::MeanStd { mean: 1.0, std: 2.0 }),
            created_unix_ms: 0,
        }
    }

    fn payload(tag: CheckpointTag, epoch: usize) -> Checkpoint {
        Checkpoint {
            meta: meta(tag, epoch),
            encoder: vec![1, 2, 3],
            head: vec![],
            optimizer: vec![9; 5],
        }
    }

    #[test]
    fn container_round_trips() {
        let ckpt = payload(CheckpointTag::Best, 2);
        let bytes = ckpt.encode().unwrap();
        assert_eq!(&bytes[..8], CHECKPOINT_MAGIC);
        assert_eq!(Checkpoint::decode(&bytes, Path::new("x")).unwrap(), ckpt);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut bytes = payload(CheckpointTag::Best, 2).encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(
            Checkpoint::decode(&bytes, Path::new("x")),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let bytes = payload(CheckpointTag::Best, 2).encode().unwrap();
        for cut in [0, 7, 20, bytes.len() - 1] {
            assert!(matches!(
                Checkpoint::decode(&bytes[..cut], Path::new("x")),
                Err(CheckpointError::Corrupt { .. })
            ));
        }
    }

    #[test]
    fn periodic_retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).with_keep_periodic(Some(2));
        for epoch in 0..5 {
            store
                .save("r1", TrainStage::Finetune, &payload(CheckpointTag::Periodic, epoch))
                .unwrap();
        }
        store
            .save("r1", TrainStage::Finetune, &payload(CheckpointTag::Best, 1))
            .unwrap();
        let epochs: Vec<usize> = store
            .list_periodic("r1", TrainStage::Finetune)
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        assert_eq!(epochs, vec![3, 4]);
        assert!(store.best_path("r1", TrainStage::Finetune).is_file());
        assert!(dir.path().join("runs/r1/epoch_0004.ckpt").is_file());
    }

    #[test]
    fn stage_selects_directory() {
        let store = CheckpointStore::new("/ckpt");
        assert_eq!(
            store.best_path("a", TrainStage::Pretrain),
            PathBuf::from("/ckpt/ssl_runs/a/best.ckpt")
        );
        assert_eq!(
            store.periodic_path("a", TrainStage::Finetune, 7),
            PathBuf::from("/ckpt/runs/a/epoch_0007.ckpt")
        );
    }

    #[test]
    fn encoder_mismatch_is_reported() {
        let ckpt = payload(CheckpointTag::Best, 0);
        let expected = FusionEncoderConfig {
            n_layers: 3,
            ..FusionEncoderConfig::tiny()
        };
        assert!(matches!(
            ckpt.verify_encoder(&expected),
            Err(CheckpointError::ShapeMismatch { ref field, .. }) if field == "encoder.n_layers"
        ));
        assert!(ckpt.verify_encoder(&FusionEncoderConfig::tiny().with_dropout(0.2)).is_ok());
    }
}
