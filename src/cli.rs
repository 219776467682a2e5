use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Ships container logs from this host and watches its health.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file. A missing file means defaults.
    #[arg(short, long, default_value = "agent.toml")]
    pub config: PathBuf,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
