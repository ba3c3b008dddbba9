//! Turn a label table and a volume directory into partition manifests and a run config.

use crate::config::{default_project, ConfigError, DataList, RunConfig};
use data_contracts::{IntensityStats, Partition, VolumeRecord};
use models::{FusionEncoderConfig, PretextObjective};
use std::path::{Path, PathBuf};
use thiserror::Error;
use volume_dataset::{
    Cohort, DatasetError, IntensityStatsEstimator, LabelTable, SplitError, SplitRatio, StatsKind,
    StratifiedSplitter, VolumeLoader,
};

#[derive(Debug, Error)]
pub enum ConfigGenError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone)]
pub struct ConfigGenRequest {
    pub task: String,
    pub project: Option<String>,
    /// `sample_id,label` CSV; `None` lists every volume for pretraining.
    pub labels: Option<PathBuf>,
    pub volume_dir: PathBuf,
    pub out_dir: PathBuf,
    pub ckpt_dir: PathBuf,
    pub config_name: String,
    pub ratio: SplitRatio,
    pub seed: u64,
    pub stats: StatsKind,
    pub max_stats_volumes: Option<usize>,
    pub skip_missing: bool,
    pub warmup_epochs: usize,
    pub total_epochs: usize,
    pub base_lr: f64,
    pub batch_size: usize,
    pub model: FusionEncoderConfig,
    pub pretext: PretextObjective,
}

impl ConfigGenRequest {
    pub fn new(task: impl Into<String>, volume_dir: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        let out_dir = out_dir.into();
        Self {
            task: task.into(),
            project: None,
            labels: None,
            volume_dir: volume_dir.into(),
            ckpt_dir: out_dir.join("checkpoints"),
            out_dir,
            config_name: "config.json".into(),
            ratio: SplitRatio::default(),
            seed: 42,
            stats: StatsKind::MeanStd,
            max_stats_volumes: None,
            skip_missing: false,
            warmup_epochs: 5,
            total_epochs: 50,
            base_lr: 1e-3,
            batch_size: 2,
            model: FusionEncoderConfig::default(),
            pretext: PretextObjective::default(),
        }
    }

    pub fn with_labels(mut self, labels: impl Into<PathBuf>) -> Self {
        self.labels = Some(labels.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub config: RunConfig,
    pub config_path: PathBuf,
    pub manifests: Vec<PathBuf>,
    /// Labeled ids dropped because no volume file was found.
    pub skipped: Vec<String>,
    pub stats: IntensityStats,
}

struct Labeled {
    records: Vec<(VolumeRecord, usize)>,
    class_names: Vec<String>,
    skipped: Vec<String>,
}

fn labeled_records(
    req: &ConfigGenRequest,
    labels: &Path,
    loader: &dyn VolumeLoader,
) -> Result<Labeled, ConfigGenError> {
    let table = LabelTable::from_csv(labels)?;
    let mut records = Vec::with_capacity(table.len());
    let mut skipped = Vec::new();
    for (id, class) in table.entries() {
        match loader.resolve(&req.volume_dir, id) {
            Some(path) => records.push((VolumeRecord::from_volume(id.clone(), path, Some(*class)), *class)),
            None if req.skip_missing => {
                tracing::warn!(id = %id, dir = %req.volume_dir.display(), "no volume for labeled sample; skipping");
                skipped.push(id.clone());
            }
            None => {
                return Err(DatasetError::MissingVolume {
                    id: id.clone(),
                    dir: req.volume_dir.clone(),
                }
                .into())
            }
        }
    }
    Ok(Labeled {
        records,
        class_names: table.class_names().to_vec(),
        skipped,
    })
}

/// Split, estimate train stats, validate, then write manifests and finally the config.
///
/// Every file is written atomically and the config goes last, so an
/// interrupted generation never leaves a config pointing at missing manifests.
pub fn generate_config(
    req: &ConfigGenRequest,
    loader: &dyn VolumeLoader,
) -> Result<GeneratedConfig, ConfigGenError> {
    let (records, ratio, class_names, skipped) = match &req.labels {
        Some(labels) => {
            let labeled = labeled_records(req, labels, loader)?;
            (labeled.records, req.ratio, labeled.class_names, labeled.skipped)
        }
        None => {
            let listed = loader.list(&req.volume_dir)?;
            if listed.is_empty() {
                return Err(DatasetError::EmptyCohort {
                    partition: "train".into(),
                }
                .into());
            }
            let records = listed
                .into_iter()
                .map(|(id, path)| (VolumeRecord::from_volume(id, path, None), 0))
                .collect();
            // Pretraining only needs train/val; test share goes to val.
            let ratio = SplitRatio::new(req.ratio.train, req.ratio.val + req.ratio.test, 0.0)?;
            (records, ratio, Vec::new(), Vec::new())
        }
    };

    let pairs: Vec<(String, usize)> = records.iter().map(|(r, c)| (r.id.clone(), *c)).collect();
    let assignment = StratifiedSplitter::new(ratio, req.seed).split(&pairs)?;
    let cohort = Cohort::from_assignment(records.into_iter().map(|(r, _)| r).collect(), &assignment)?;
    tracing::info!(
        train = cohort.train().len(),
        val = cohort.val().len(),
        test = cohort.test().len(),
        seed = req.seed,
        "cohort split"
    );

    let mut estimator = IntensityStatsEstimator::new(req.stats);
    if let Some(n) = req.max_stats_volumes {
        estimator = estimator.with_max_volumes(n);
    }
    let stats = estimator.estimate(cohort.train(), loader)?;
    tracing::info!(stats = %stats.describe(), "intensity stats from train partition");

    let manifest_name = |p: Partition| PathBuf::from(format!("{p}.json"));
    let config = RunConfig {
        task: req.task.clone(),
        project: req.project.clone().unwrap_or_else(|| default_project(&req.task)),
        data_list: DataList {
            train: manifest_name(Partition::Train),
            val: manifest_name(Partition::Val),
            test: (!cohort.test().is_empty()).then(|| manifest_name(Partition::Test)),
        },
        ckpt_dir: req.ckpt_dir.clone(),
        ssl_ckpt: None,
        warmup_epochs: req.warmup_epochs,
        total_epochs: req.total_epochs,
        base_lr: req.base_lr,
        min_lr: 0.0,
        weight_decay: 1e-2,
        batch_size: req.batch_size,
        intensity_stats: stats,
        num_classes: class_names.len().max(2),
        class_names,
        seed: req.seed,
        run_id: None,
        ckpt_every_epochs: 1,
        keep_periodic: Some(3),
        patience: 0,
        min_delta: 0.0,
        strict_loading: false,
        augment: true,
        model: req.model.clone(),
        pretext: req.pretext,
    };
    config.validate()?;
    let manifests = cohort.save_manifests(&req.out_dir, Some(req.seed))?;
    let config_path = req.out_dir.join(&req.config_name);
    config.save(&config_path)?;
    tracing::info!(path = %config_path.display(), "run config written");

    Ok(GeneratedConfig {
        config,
        config_path,
        manifests,
        skipped,
        stats,
    })
}
