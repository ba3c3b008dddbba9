use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use data_contracts::PartitionManifest;
use std::path::PathBuf;
use training::util::{validate_backend_choice, BackendKind};
use volume_dataset::RawVolumeLoader;

use crate::{GradientSaliency, SaliencyBackend, SaliencyRunner, TargetClass};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArg {
    Predicted,
    Label,
}

impl From<TargetArg> for TargetClass {
    fn from(value: TargetArg) -> Self {
        match value {
            TargetArg::Predicted => TargetClass::Predicted,
            TargetArg::Label => TargetClass::Label,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "saliency", about = "Write per-voxel saliency maps for a classifier checkpoint")]
pub struct SaliencyArgs {
    /// Fine-tuned classifier checkpoint (usually runs/<run_id>/best.ckpt).
    #[arg(long)]
    pub checkpoint: PathBuf,
    /// Partition manifest listing the samples to explain.
    #[arg(long)]
    pub manifest: PathBuf,
    #[arg(long)]
    pub out_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = TargetArg::Predicted)]
    pub target: TargetArg,
    /// Keep the gradient sign instead of its magnitude.
    #[arg(long, default_value_t = false)]
    pub signed: bool,
    /// Skip unreadable samples instead of failing the run.
    #[arg(long, default_value_t = false)]
    pub lenient: bool,
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
}

pub fn run_saliency(args: SaliencyArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let manifest = PartitionManifest::load(&args.manifest)?;
    let device = <SaliencyBackend as Backend>::Device::default();
    let runner = SaliencyRunner::new(&args.out_dir)
        .with_target(args.target.into())
        .strict(!args.lenient);
    let mut method = GradientSaliency::new().signed(args.signed);
    let summary = runner.run::<SaliencyBackend, _>(
        &args.checkpoint,
        &manifest.records,
        &RawVolumeLoader,
        &mut method,
        &device,
    )?;
    println!(
        "wrote {} saliency maps to {} (skipped {})",
        summary.records.len(),
        args.out_dir.display(),
        summary.skipped.len()
    );
    for id in &summary.skipped {
        println!("skipped: {id}");
    }
    Ok(())
}
