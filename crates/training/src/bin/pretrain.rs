use clap::Parser;
use training::util::{init_tracing, run_pretrain, TrainArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = TrainArgs::parse();
    run_pretrain(args)
}
