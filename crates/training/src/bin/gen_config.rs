use clap::Parser;
use training::util::{init_tracing, run_gen_config, GenConfigArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = GenConfigArgs::parse();
    run_gen_config(args)
}
