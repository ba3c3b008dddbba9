use clap::Parser;
use saliency::util::{run_saliency, SaliencyArgs};
use training::util::init_tracing;

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = SaliencyArgs::parse();
    run_saliency(args)
}
