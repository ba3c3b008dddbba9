use burn::backend::Autodiff;
use burn::optim::AdamWConfig;
use burn::tensor::backend::Backend;
use clap::{Args, Parser, ValueEnum};
use data_contracts::PartitionManifest;
use models::{ClassificationHeadConfig, FusionClassifier, FusionModel, FusionPretext, PretextHeadConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use volume_dataset::{
    AugmentConfig, Cohort, RawVolumeLoader, RecordBatches, SplitRatio, StatsKind, VolumeAugment,
    VolumeLoader,
};

use crate::checkpoint::{load_classifier, CheckpointStore, TrainStage};
use crate::config::RunConfig;
use crate::configgen::{generate_config, ConfigGenRequest};
use crate::eval::evaluate_classifier;
use crate::objective::{Objective, PretextLoss, SupervisedObjective};
use crate::report::{FanoutReporter, JsonlReporter, RunReporter, TracingReporter};
use crate::trainer::{RunSummary, TrainingLoop};
use crate::TrainBackend;

type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            println!("note: built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`). Bins only.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Fine-tune the fusion classifier from a run config")]
pub struct TrainArgs {
    /// Run config (JSON, or TOML by extension).
    #[arg(long)]
    pub config: PathBuf,
    /// Override the run id (defaults to the config's, then `<task>-<unix_millis>`).
    #[arg(long)]
    pub run_id: Option<String>,
    /// Continue from this checkpoint (best or periodic) of the same run.
    #[arg(long)]
    pub resume: Option<PathBuf>,
    /// Override `ssl_ckpt`: pretrained encoder checkpoint to start from.
    #[arg(long)]
    pub ssl_ckpt: Option<PathBuf>,
    /// Append per-epoch metrics as JSON lines to this file.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
}

fn reporter(metrics_out: Option<&Path>) -> anyhow::Result<Box<dyn RunReporter>> {
    let mut fanout = FanoutReporter::new(vec![Box::new(TracingReporter)]);
    if let Some(path) = metrics_out {
        let jsonl = JsonlReporter::create(path)
            .map_err(|e| anyhow::anyhow!("failed to open metrics file {}: {e}", path.display()))?;
        fanout.push(Box::new(jsonl));
    }
    Ok(Box::new(fanout))
}

/// Stop the run between batches on Ctrl-C.
fn install_cancel_handler(cancel: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }
}

fn load_cohort(cfg: &RunConfig) -> anyhow::Result<Cohort> {
    let cohort = Cohort::from_manifests(
        &cfg.data_list.train,
        &cfg.data_list.val,
        cfg.data_list.test.as_deref(),
    )?;
    println!(
        "cohort: {} train / {} val / {} test",
        cohort.train().len(),
        cohort.val().len(),
        cohort.test().len()
    );
    Ok(cohort)
}

fn record_batches(cfg: &RunConfig, cohort: &Cohort) -> (RecordBatches, RecordBatches) {
    let loader: Arc<dyn VolumeLoader> = Arc::new(RawVolumeLoader);
    let train = RecordBatches::new(
        cohort.train().to_vec(),
        loader.clone(),
        cfg.intensity_stats,
        cfg.train_batches(),
    );
    let val = RecordBatches::new(
        cohort.val().to_vec(),
        loader,
        cfg.intensity_stats,
        cfg.eval_batches(),
    );
    (train, val)
}

fn augment(cfg: &RunConfig) -> VolumeAugment {
    if cfg.augment {
        VolumeAugment::new(AugmentConfig::default())
    } else {
        VolumeAugment::new(AugmentConfig::disabled())
    }
}

fn run_stage<Obj>(
    cfg: &RunConfig,
    args: &TrainArgs,
    stage: TrainStage,
    model: Obj::Model,
    objective: &Obj,
    cohort: &Cohort,
) -> anyhow::Result<RunSummary<Obj::Model>>
where
    Obj: Objective<ADBackend>,
{
    let run_id = args.run_id.clone().unwrap_or_else(|| cfg.resolved_run_id());
    let store = CheckpointStore::new(&cfg.ckpt_dir).with_keep_periodic(cfg.keep_periodic);
    let mut trainer = TrainingLoop::<ADBackend>::new(cfg.trainer_config(stage, run_id.clone()), store)
        .with_reporter(reporter(args.metrics_out.as_deref())?);
    if let Some(path) = &args.resume {
        let checkpoint = CheckpointStore::load(path)?;
        if checkpoint.meta.run_id != run_id {
            anyhow::bail!(
                "checkpoint {} belongs to run `{}`; pass --run-id {} to resume it",
                path.display(),
                checkpoint.meta.run_id,
                checkpoint.meta.run_id
            );
        }
        trainer.resume_from(checkpoint, path.clone());
    }
    install_cancel_handler(trainer.cancel_handle());

    let (mut train, mut val) = record_batches(cfg, cohort);
    let optim = AdamWConfig::new()
        .with_weight_decay(cfg.weight_decay as f32)
        .init::<ADBackend, Obj::Model>();
    println!(
        "run {run_id} ({}): {} epochs, {} steps/epoch, objective scored by {}",
        stage.as_str(),
        cfg.total_epochs,
        volume_dataset::BatchSource::len_batches(&train),
        objective.score_name()
    );
    let summary = trainer.run(model, optim, objective, &mut train, &mut val)?;
    let run_dir = trainer.store().run_dir(&run_id, stage);
    if summary.cancelled {
        println!("cancelled after step {}", summary.global_step);
    } else if summary.stopped_early {
        println!("stopped early after {} epochs", summary.epochs_run);
    }
    match (summary.best_score, &summary.best_path) {
        (Some(score), Some(path)) => println!(
            "best {} {score:.4} at epoch {} -> {}",
            objective.score_name(),
            summary.best_epoch.unwrap_or_default(),
            path.display()
        ),
        _ => println!("no best checkpoint written under {}", run_dir.display()),
    }
    Ok(summary)
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = RunConfig::load(&args.config)?;
    let cohort = load_cohort(&cfg)?;
    cohort.validate_labels(cfg.num_classes)?;

    let device = <ADBackend as Backend>::Device::default();
    let mut model = FusionClassifier::<ADBackend>::new(
        cfg.model.clone(),
        ClassificationHeadConfig {
            num_classes: cfg.num_classes,
            ..Default::default()
        },
        &device,
    );
    if let Some(path) = args.ssl_ckpt.as_ref().or(cfg.ssl_ckpt.as_ref()) {
        let checkpoint = CheckpointStore::load(path)?;
        if checkpoint.meta.stage != TrainStage::Pretrain {
            tracing::warn!(path = %path.display(), "ssl_ckpt is not a pretraining checkpoint; loading its encoder anyway");
        }
        let encoder = checkpoint.restore_encoder(model.encoder().clone(), path, &device)?;
        model = model.with_encoder(encoder);
        println!("initialized encoder from {}", path.display());
    }

    let augment = cfg.augment.then(|| VolumeAugment::new(AugmentConfig::default()));
    let objective = SupervisedObjective::new(augment, cfg.seed);
    run_stage(&cfg, &args, TrainStage::Finetune, model, &objective, &cohort)?;
    Ok(())
}

pub fn run_pretrain(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = RunConfig::load(&args.config)?;
    let cohort = load_cohort(&cfg)?;
    let device = <ADBackend as Backend>::Device::default();
    let model = FusionPretext::<ADBackend>::new(cfg.model.clone(), PretextHeadConfig::default(), &device);
    let objective = PretextLoss::new(cfg.pretext, augment(&cfg), cfg.seed);
    run_stage(&cfg, &args, TrainStage::Pretrain, model, &objective, &cohort)?;
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "eval", about = "Evaluate a fine-tuned classifier checkpoint on a partition manifest")]
pub struct EvalArgs {
    #[arg(long)]
    pub checkpoint: PathBuf,
    /// Partition manifest to score (usually test.json).
    #[arg(long)]
    pub manifest: PathBuf,
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,
    /// Fail on unreadable volumes instead of skipping them.
    #[arg(long, default_value_t = false)]
    pub strict: bool,
    /// Write the report as JSON here.
    #[arg(long)]
    pub report_out: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
}

pub fn run_eval(args: EvalArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let device = <TrainBackend as Backend>::Device::default();
    let (model, checkpoint) = load_classifier::<TrainBackend>(&args.checkpoint, &device)?;
    let Some(stats) = checkpoint.meta.intensity_stats else {
        anyhow::bail!(
            "checkpoint {} carries no intensity stats",
            args.checkpoint.display()
        );
    };
    let manifest = PartitionManifest::load(&args.manifest)?;
    let mut batches = RecordBatches::new(
        manifest.records,
        Arc::new(RawVolumeLoader),
        stats,
        volume_dataset::BatchConfig::eval(args.batch_size, args.strict),
    );
    let report = evaluate_classifier(&model, &mut batches, &device)?;
    println!(
        "accuracy {:.4} ({}/{}), skipped {}",
        report.accuracy, report.correct, report.count, report.skipped
    );
    for (class, recall) in report.per_class_recall().into_iter().enumerate() {
        if let Some(recall) = recall {
            println!("class {class}: recall {recall:.4}");
        }
    }
    if let Some(path) = &args.report_out {
        let json = serde_json::to_vec_pretty(&report)?;
        data_contracts::write_atomic(path, &json)?;
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsMode {
    MeanStd,
    Percentile,
}

#[derive(Args, Debug, Clone)]
pub struct RatioArgs {
    #[arg(long, default_value_t = 0.7)]
    pub train_ratio: f64,
    #[arg(long, default_value_t = 0.15)]
    pub val_ratio: f64,
    #[arg(long, default_value_t = 0.15)]
    pub test_ratio: f64,
}

#[derive(Parser, Debug)]
#[command(name = "gen_config", about = "Split a labeled cohort, compute stats and write a run config")]
pub struct GenConfigArgs {
    #[arg(long)]
    pub task: String,
    /// `sample_id,label` CSV; omit to list every volume for pretraining.
    #[arg(long)]
    pub labels: Option<PathBuf>,
    #[arg(long)]
    pub volume_dir: PathBuf,
    #[arg(long)]
    pub out_dir: PathBuf,
    /// Checkpoint root written into the config (default `<out_dir>/checkpoints`).
    #[arg(long)]
    pub ckpt_dir: Option<PathBuf>,
    #[command(flatten)]
    pub ratio: RatioArgs,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long, value_enum, default_value_t = StatsMode::MeanStd)]
    pub stats: StatsMode,
    #[arg(long, default_value_t = 0.5)]
    pub low_percentile: f64,
    #[arg(long, default_value_t = 99.5)]
    pub high_percentile: f64,
    /// Only read this many train volumes for stats.
    #[arg(long)]
    pub max_stats_volumes: Option<usize>,
    /// Drop labeled samples without a volume file instead of failing.
    #[arg(long, default_value_t = false)]
    pub skip_missing: bool,
    #[arg(long, default_value_t = 5)]
    pub warmup_epochs: usize,
    #[arg(long, default_value_t = 50)]
    pub total_epochs: usize,
    #[arg(long, default_value_t = 1e-3)]
    pub base_lr: f64,
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,
    /// Write the config as TOML instead of JSON.
    #[arg(long, default_value_t = false)]
    pub toml: bool,
}

pub fn run_gen_config(args: GenConfigArgs) -> anyhow::Result<()> {
    let mut req = ConfigGenRequest::new(args.task, args.volume_dir, args.out_dir);
    req.labels = args.labels;
    if let Some(ckpt_dir) = args.ckpt_dir {
        req.ckpt_dir = ckpt_dir;
    }
    req.ratio = SplitRatio::new(args.ratio.train_ratio, args.ratio.val_ratio, args.ratio.test_ratio)?;
    req.seed = args.seed;
    req.stats = match args.stats {
        StatsMode::MeanStd => StatsKind::MeanStd,
        StatsMode::Percentile => StatsKind::Percentile {
            low: args.low_percentile,
            high: args.high_percentile,
        },
    };
    req.max_stats_volumes = args.max_stats_volumes;
    req.skip_missing = args.skip_missing;
    req.warmup_epochs = args.warmup_epochs;
    req.total_epochs = args.total_epochs;
    req.base_lr = args.base_lr;
    req.batch_size = args.batch_size;
    if args.toml {
        req.config_name = "config.toml".into();
    }
    let generated = generate_config(&req, &RawVolumeLoader)?;
    for path in &generated.manifests {
        println!("wrote {}", path.display());
    }
    if !generated.skipped.is_empty() {
        println!("skipped {} samples without volumes", generated.skipped.len());
    }
    println!("stats: {}", generated.stats.describe());
    println!("config: {}", generated.config_path.display());
    Ok(())
}
