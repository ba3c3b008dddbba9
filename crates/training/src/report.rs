//! Run reporting seam. The training loop pushes events here; sinks decide where
//! they go (tracing, a JSONL metrics file, or several at once).

use crate::checkpoint::CheckpointTag;
use crate::trainer::RunStage;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
    pub lr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub step: usize,
    pub train_loss: f64,
    /// Validation score (higher is better); negative train loss when there is no validation data.
    pub score: f64,
    pub validated: bool,
    pub lr: f64,
    pub improved: bool,
    pub best_score: Option<f64>,
    pub skipped_samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    pub tag: CheckpointTag,
    pub epoch: usize,
    pub step: usize,
    pub path: PathBuf,
}

pub trait RunReporter {
    fn on_stage(&mut self, _stage: RunStage) {}
    fn on_step(&mut self, _step: &StepReport) {}
    fn on_epoch(&mut self, _epoch: &EpochReport) {}
    fn on_checkpoint(&mut self, _checkpoint: &CheckpointReport) {}
    fn on_warning(&mut self, _message: &str) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl RunReporter for TracingReporter {
    fn on_stage(&mut self, stage: RunStage) {
        tracing::debug!(stage = stage.as_str(), "stage");
    }

    fn on_step(&mut self, step: &StepReport) {
        tracing::trace!(epoch = step.epoch, step = step.step, loss = step.loss, lr = step.lr, "step");
    }

    fn on_epoch(&mut self, e: &EpochReport) {
        tracing::info!(
            epoch = e.epoch,
            step = e.step,
            train_loss = e.train_loss,
            score = e.score,
            validated = e.validated,
            lr = e.lr,
            improved = e.improved,
            "epoch finished"
        );
    }

    fn on_checkpoint(&mut self, c: &CheckpointReport) {
        tracing::info!(tag = ?c.tag, epoch = c.epoch, path = %c.path.display(), "checkpoint saved");
    }

    fn on_warning(&mut self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// Appends one JSON line per epoch to a metrics file.
#[derive(Debug)]
pub struct JsonlReporter {
    path: PathBuf,
    file: File,
}

impl JsonlReporter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append<T: Serialize>(&mut self, kind: &str, value: &T) {
        let line = serde_json::json!({ "event": kind, "data": value });
        if let Err(e) = writeln!(self.file, "{line}") {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append metrics");
        }
    }
}

impl RunReporter for JsonlReporter {
    fn on_epoch(&mut self, epoch: &EpochReport) {
        self.append("epoch", epoch);
    }

    fn on_checkpoint(&mut self, checkpoint: &CheckpointReport) {
        self.append("checkpoint", checkpoint);
    }

    fn on_warning(&mut self, message: &str) {
        self.append("warning", &message);
    }
}

/// Forwards every event to each inner reporter, in order.
#[derive(Default)]
pub struct FanoutReporter {
    sinks: Vec<Box<dyn RunReporter>>,
}

impl FanoutReporter {
    pub fn new(sinks: Vec<Box<dyn RunReporter>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn RunReporter>) {
        self.sinks.push(sink);
    }
}

impl RunReporter for FanoutReporter {
    fn on_stage(&mut self, stage: RunStage) {
        self.sinks.iter_mut().for_each(|s| s.on_stage(stage));
    }

    fn on_step(&mut self, step: &StepReport) {
        self.sinks.iter_mut().for_each(|s| s.on_step(step));
    }

    fn on_epoch(&mut self, epoch: &EpochReport) {
        self.sinks.iter_mut().for_each(|s| s.on_epoch(epoch));
    }

    fn on_checkpoint(&mut self, checkpoint: &CheckpointReport) {
        self.sinks.iter_mut().for_each(|s| s.on_checkpoint(checkpoint));
    }

    fn on_warning(&mut self, message: &str) {
        self.sinks.iter_mut().for_each(|s| s.on_warning(message));
    }
}

/// Records events in memory; handy for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryReporter {
    pub stages: Vec<RunStage>,
    pub epochs: Vec<EpochReport>,
    pub checkpoints: Vec<CheckpointReport>,
    pub warnings: Vec<String>,
    pub steps: usize,
}

impl RunReporter for MemoryReporter {
    fn on_stage(&mut self, stage: RunStage) {
        self.stages.push(stage);
    }

    fn on_step(&mut self, _step: &StepReport) {
        self.steps += 1;
    }

    fn on_epoch(&mut self, epoch: &EpochReport) {
        self.epochs.push(epoch.clone());
    }

    fn on_checkpoint(&mut self, checkpoint: &CheckpointReport) {
        self.checkpoints.push(checkpoint.clone());
    }

    fn on_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }
}

/// Shares one reporter between the loop and the caller.
impl<R: RunReporter + ?Sized> RunReporter for std::sync::Arc<std::sync::Mutex<R>> {
    fn on_stage(&mut self, stage: RunStage) {
        if let Ok(mut r) = self.lock() {
            r.on_stage(stage);
        }
    }

    fn on_step(&mut self, step: &StepReport) {
        if let Ok(mut r) = self.lock() {
            r.on_step(step);
        }
    }

    fn on_epoch(&mut self, epoch: &EpochReport) {
        if let Ok(mut r) = self.lock() {
            r.on_epoch(epoch);
        }
    }

    fn on_checkpoint(&mut self, checkpoint: &CheckpointReport) {
        if let Ok(mut r) = self.lock() {
            r.on_checkpoint(checkpoint);
        }
    }

    fn on_warning(&mut self, message: &str) {
        if let Ok(mut r) = self.lock() {
            r.on_warning(message);
        }
    }
}
