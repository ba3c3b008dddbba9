//! Training stages for the fusion classifier: self-supervised pretraining and
//! supervised fine-tuning, with checkpointing, resume and run reporting.
#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod configgen;
pub mod eval;
pub mod objective;
pub mod report;
pub mod schedule;
pub mod trainer;
pub mod util;

pub use checkpoint::{
    load_classifier, Checkpoint, CheckpointError, CheckpointMeta, CheckpointStore, CheckpointTag,
    RunMeta, TrainStage,
};
pub use config::{ConfigError, DataList, RunConfig};
pub use configgen::{generate_config, ConfigGenError, ConfigGenRequest, GeneratedConfig};
pub use eval::{evaluate_classifier, predict, EvalReport};
pub use objective::{nt_xent, EvalTotals, Objective, PretextLoss, SupervisedObjective};
pub use report::{
    CheckpointReport, EpochReport, FanoutReporter, JsonlReporter, MemoryReporter, RunReporter,
    StepReport, TracingReporter,
};
pub use schedule::{ScheduleError, SchedulePhase, ScheduleState, WarmupCosine};
pub use trainer::{RunStage, RunSummary, TrainError, TrainerConfig, TrainingLoop};
pub use util::{run_gen_config, run_pretrain, run_train, EvalArgs, GenConfigArgs, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
