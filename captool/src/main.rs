use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::Parser;

use captool_core::config::load_config;
use captool_core::Runtime;

#[derive(Parser, Debug)]
#[clap(name = "captool", about = "Passive traffic profiling engine")]
struct Args {
    /// Path of the configuration file.
    #[clap(short, long, parse(from_os_str), default_value = "configs/captool.toml")]
    config: PathBuf,
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args.config)?;
    let mut runtime = Runtime::new(config)?;
    runtime.run();
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        exit(1);
    }
}
