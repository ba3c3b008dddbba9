//! The epoch/step training loop shared by pretraining and fine-tuning.

use crate::checkpoint::{
    decode_optimizer, encode_optimizer, unix_millis, Checkpoint, CheckpointError, CheckpointMeta,
    CheckpointStore, CheckpointTag, RunMeta, TrainStage, CHECKPOINT_FORMAT_VERSION,
};
use crate::objective::{scalar, EvalTotals, Objective};
use crate::report::{CheckpointReport, EpochReport, RunReporter, StepReport, TracingReporter};
use crate::schedule::{ScheduleError, WarmupCosine};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use data_contracts::IntensityStats;
use models::{FusionModel, ModelConfigError};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use volume_dataset::{BatchSource, DatasetError};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid trainer config: {0}")]
    Config(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Model(#[from] ModelConfigError),
    #[error("loss diverged at epoch {epoch}, step {step}: {loss}")]
    Divergence { epoch: usize, step: usize, loss: f64 },
    #[error("cannot resume: {0}")]
    Resume(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Initializing,
    WarmingUp,
    Decaying,
    Validating,
    Checkpointing,
    Finished,
    Failed,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Initializing => "initializing",
            RunStage::WarmingUp => "warming_up",
            RunStage::Decaying => "decaying",
            RunStage::Validating => "validating",
            RunStage::Checkpointing => "checkpointing",
            RunStage::Finished => "finished",
            RunStage::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub run_id: String,
    pub stage: TrainStage,
    pub warmup_epochs: usize,
    pub total_epochs: usize,
    pub base_lr: f64,
    pub lr_floor: f64,
    /// Periodic checkpoint interval in epochs; 0 disables periodic checkpoints.
    pub ckpt_every_epochs: usize,
    /// Epochs without improvement before stopping; 0 disables early stopping.
    pub patience: usize,
    pub min_delta: f64,
    pub intensity_stats: Option<IntensityStats>,
}

impl TrainerConfig {
    pub fn new(run_id: impl Into<String>, stage: TrainStage) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            warmup_epochs: 1,
            total_epochs: 10,
            base_lr: 1e-3,
            lr_floor: 0.0,
            ckpt_every_epochs: 1,
            patience: 0,
            min_delta: 0.0,
            intensity_stats: None,
        }
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        if self.run_id.trim().is_empty() {
            return Err(TrainError::Config("run_id must not be empty".into()));
        }
        if self.total_epochs == 0 {
            return Err(TrainError::Config("total_epochs must be > 0".into()));
        }
        if self.warmup_epochs > self.total_epochs {
            return Err(TrainError::Config(format!(
                "warmup_epochs {} exceeds total_epochs {}",
                self.warmup_epochs, self.total_epochs
            )));
        }
        if !self.min_delta.is_finite() || self.min_delta < 0.0 {
            return Err(TrainError::Config(format!(
                "min_delta must be finite and >= 0 (got {})",
                self.min_delta
            )));
        }
        Ok(())
    }
}

/// Outcome of a run that did not fail.
#[derive(Debug)]
pub struct RunSummary<M> {
    pub model: M,
    /// Epochs completed in this invocation (resumed epochs not counted).
    pub epochs_run: usize,
    /// Last completed epoch, 0-based.
    pub last_epoch: Option<usize>,
    pub global_step: usize,
    pub best_score: Option<f64>,
    pub best_epoch: Option<usize>,
    pub best_path: Option<PathBuf>,
    pub cancelled: bool,
    pub stopped_early: bool,
    pub history: Vec<EpochReport>,
}

struct PendingResume {
    checkpoint: Checkpoint,
    path: PathBuf,
}

pub struct TrainingLoop<B: AutodiffBackend> {
    cfg: TrainerConfig,
    store: CheckpointStore,
    reporter: Box<dyn RunReporter>,
    cancel: Arc<AtomicBool>,
    stage: RunStage,
    resume: Option<PendingResume>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> TrainingLoop<B> {
    pub fn new(cfg: TrainerConfig, store: CheckpointStore) -> Self {
        Self {
            cfg,
            store,
            reporter: Box::new(TracingReporter),
            cancel: Arc::new(AtomicBool::new(false)),
            stage: RunStage::Initializing,
            resume: None,
            _backend: PhantomData,
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn RunReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.cfg
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Set to `true` from any thread to stop the run before the next batch.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    /// Continue a previous run from `checkpoint` on the next call to [`run`](Self::run).
    pub fn resume_from(&mut self, checkpoint: Checkpoint, path: impl Into<PathBuf>) {
        self.resume = Some(PendingResume {
            checkpoint,
            path: path.into(),
        });
    }

    fn enter(&mut self, stage: RunStage) {
        if self.stage != stage {
            self.stage = stage;
            self.reporter.on_stage(stage);
        }
    }

    /// The reporter owns the log line ([`TracingReporter`] emits it).
    fn warn(&mut self, message: String) {
        self.reporter.on_warning(&message);
    }

    /// Run to completion, early stop or cancellation.
    ///
    /// Any error leaves the loop in [`RunStage::Failed`].
    pub fn run<Obj, O>(
        &mut self,
        model: Obj::Model,
        optim: O,
        objective: &Obj,
        train: &mut dyn BatchSource,
        val: &mut dyn BatchSource,
    ) -> Result<RunSummary<Obj::Model>, TrainError>
    where
        Obj: Objective<B>,
        O: Optimizer<Obj::Model, B>,
    {
        // Always report the initial stage, even on a reused loop.
        self.stage = RunStage::Initializing;
        self.reporter.on_stage(RunStage::Initializing);
        let result = self.run_inner(model, optim, objective, train, val);
        match &result {
            Ok(_) => self.enter(RunStage::Finished),
            Err(e) => {
                tracing::error!(error = %e, run_id = %self.cfg.run_id, "training failed");
                self.enter(RunStage::Failed);
            }
        }
        result
    }

    fn run_inner<Obj, O>(
        &mut self,
        mut model: Obj::Model,
        mut optim: O,
        objective: &Obj,
        train: &mut dyn BatchSource,
        val: &mut dyn BatchSource,
    ) -> Result<RunSummary<Obj::Model>, TrainError>
    where
        Obj: Objective<B>,
        O: Optimizer<Obj::Model, B>,
    {
        self.cfg.validate()?;
        model.encoder_config().validate()?;
        let steps_per_epoch = train.len_batches();
        if steps_per_epoch == 0 {
            return Err(DatasetError::EmptyCohort {
                partition: "train".into(),
            }
            .into());
        }
        let schedule = WarmupCosine::from_epochs(
            self.cfg.base_lr,
            self.cfg.warmup_epochs,
            self.cfg.total_epochs,
            steps_per_epoch,
            self.cfg.lr_floor,
        )?;
        let device = model.encoder().device();

        let mut start_epoch = 0;
        let mut global_step = 0;
        let mut best_score: Option<f64> = None;
        let mut best_epoch: Option<usize> = None;
        let mut best_path: Option<PathBuf> = None;
        if let Some(PendingResume { checkpoint, path }) = self.resume.take() {
            let meta = &checkpoint.meta;
            if meta.stage != self.cfg.stage {
                return Err(TrainError::Resume(format!(
                    "checkpoint is from {} stage, run is {}",
                    meta.stage.as_str(),
                    self.cfg.stage.as_str()
                )));
            }
            if meta.steps_per_epoch != steps_per_epoch {
                return Err(TrainError::Resume(format!(
                    "checkpoint has {} steps per epoch, data yields {steps_per_epoch}",
                    meta.steps_per_epoch
                )));
            }
            model = checkpoint.restore_model(model, &path, &device)?;
            if !checkpoint.optimizer.is_empty() {
                optim = decode_optimizer::<B, Obj::Model, O>(optim, &checkpoint.optimizer, &path, &device)?;
            }
            start_epoch = meta.epoch + 1;
            global_step = meta.step;
            match self.store.read_run_meta(&self.cfg.run_id, self.cfg.stage) {
                Ok(run) => {
                    best_score = run.best_score;
                    best_epoch = run.best_epoch;
                }
                Err(_) if meta.tag == CheckpointTag::Best => {
                    best_score = meta.score;
                    best_epoch = Some(meta.epoch);
                }
                Err(e) => tracing::debug!(error = %e, "no run metadata to resume best score from"),
            }
            let best = self.store.best_path(&self.cfg.run_id, self.cfg.stage);
            if best_score.is_some() && best.exists() {
                best_path = Some(best);
            }
            tracing::info!(
                path = %path.display(),
                epoch = start_epoch,
                step = global_step,
                lr = schedule.rate(global_step),
                "resuming run"
            );
        }

        let mut history = Vec::new();
        let mut epochs_run = 0;
        let mut last_epoch = start_epoch.checked_sub(1);
        let mut since_improvement = 0usize;
        let mut stopped_early = false;
        let mut warned_no_val = false;

        for epoch in start_epoch..self.cfg.total_epochs {
            train.start_epoch(epoch);
            let mut loss_sum = 0.0;
            let mut batches = 0usize;
            while let Some(batch) = train.next_batch()? {
                if self.cancel.load(Ordering::SeqCst) {
                    tracing::info!(epoch, step = global_step, "run cancelled");
                    return Ok(RunSummary {
                        model,
                        epochs_run,
                        last_epoch,
                        global_step,
                        best_score,
                        best_epoch,
                        best_path,
                        cancelled: true,
                        stopped_early: false,
                        history,
                    });
                }
                let phase = if global_step < schedule.warmup_steps {
                    RunStage::WarmingUp
                } else {
                    RunStage::Decaying
                };
                self.enter(phase);

                let loss = objective.loss(&model, &batch, global_step)?;
                let loss_value = scalar(loss.clone().detach());
                if !loss_value.is_finite() {
                    return Err(TrainError::Divergence {
                        epoch,
                        step: global_step,
                        loss: loss_value,
                    });
                }
                let lr = schedule.rate(global_step);
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);
                global_step += 1;
                loss_sum += loss_value;
                batches += 1;
                self.reporter.on_step(&StepReport {
                    epoch,
                    step: global_step,
                    loss: loss_value,
                    lr,
                });
            }
            if self.cancel.load(Ordering::SeqCst) {
                tracing::info!(epoch, step = global_step, "run cancelled");
                return Ok(RunSummary {
                    model,
                    epochs_run,
                    last_epoch,
                    global_step,
                    best_score,
                    best_epoch,
                    best_path,
                    cancelled: true,
                    stopped_early: false,
                    history,
                });
            }
            let train_loss = if batches == 0 {
                0.0
            } else {
                loss_sum / batches as f64
            };

            self.enter(RunStage::Validating);
            let (score, validated) = if val.len_batches() == 0 {
                if !warned_no_val {
                    self.warn("validation partition is empty; scoring epochs by negative training loss".into());
                    warned_no_val = true;
                }
                (-train_loss, false)
            } else {
                let inner = model.valid();
                val.start_epoch(epoch);
                let mut totals = EvalTotals::default();
                let mut index = 0;
                while let Some(batch) = val.next_batch()? {
                    totals.add(objective.evaluate(&inner, &batch, index)?);
                    index += 1;
                }
                (objective.score(&totals), true)
            };

            let improved = match best_score {
                None => score.is_finite(),
                Some(best) => score > best + self.cfg.min_delta,
            };
            let mut checkpoint_tags = Vec::new();
            if improved {
                checkpoint_tags.push(CheckpointTag::Best);
            }
            let every = self.cfg.ckpt_every_epochs;
            if every > 0 && (epoch + 1) % every == 0 {
                checkpoint_tags.push(CheckpointTag::Periodic);
            }

            if !checkpoint_tags.is_empty() {
                self.enter(RunStage::Checkpointing);
                let optimizer_bytes = encode_optimizer::<B, Obj::Model, O>(&optim)?;
                for tag in checkpoint_tags {
                    let meta = CheckpointMeta {
                        format_version: CHECKPOINT_FORMAT_VERSION,
                        run_id: self.cfg.run_id.clone(),
                        stage: self.cfg.stage,
                        tag,
                        epoch,
                        step: global_step,
                        steps_per_epoch,
                        score: Some(score),
                        encoder_config: model.encoder_config().clone(),
                        head: Some(model.head_spec()),
                        intensity_stats: self.cfg.intensity_stats,
                        created_unix_ms: unix_millis(),
                    };
                    let saved = Checkpoint::from_model::<B, _>(meta, &model, optimizer_bytes.clone())
                        .and_then(|ckpt| self.store.save(&self.cfg.run_id, self.cfg.stage, &ckpt));
                    match (tag, saved) {
                        (_, Ok(path)) => {
                            if tag == CheckpointTag::Best {
                                best_score = Some(score);
                                best_epoch = Some(epoch);
                                best_path = Some(path.clone());
                            }
                            self.reporter.on_checkpoint(&CheckpointReport {
                                tag,
                                epoch,
                                step: global_step,
                                path,
                            });
                        }
                        (CheckpointTag::Best, Err(e)) => return Err(e.into()),
                        (CheckpointTag::Periodic, Err(e)) => {
                            let best_on_disk = best_path.as_deref().is_some_and(Path::exists);
                            if !best_on_disk {
                                return Err(e.into());
                            }
                            self.warn(format!("periodic checkpoint for epoch {epoch} failed: {e}"));
                        }
                    }
                }
                self.store.write_run_meta(&RunMeta {
                    run_id: self.cfg.run_id.clone(),
                    stage: self.cfg.stage,
                    epoch,
                    step: global_step,
                    score: Some(score),
                    best_score,
                    best_epoch,
                    updated_unix_ms: unix_millis(),
                })?;
            }

            let report = EpochReport {
                epoch,
                step: global_step,
                train_loss,
                score,
                validated,
                lr: schedule.rate(global_step),
                improved,
                best_score,
                skipped_samples: train.skipped() + val.skipped(),
            };
            self.reporter.on_epoch(&report);
            history.push(report);
            epochs_run += 1;
            last_epoch = Some(epoch);

            if improved {
                since_improvement = 0;
            } else {
                since_improvement += 1;
            }
            if self.cfg.patience > 0 && since_improvement >= self.cfg.patience {
                tracing::info!(
                    epoch,
                    patience = self.cfg.patience,
                    best_score = ?best_score,
                    "early stopping"
                );
                stopped_early = true;
                break;
            }
        }

        Ok(RunSummary {
            model,
            epochs_run,
            last_epoch,
            global_step,
            best_score,
            best_epoch,
            best_path,
            cancelled: false,
            stopped_early,
            history,
        })
    }
}
