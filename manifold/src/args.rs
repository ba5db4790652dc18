use std::path::PathBuf;

use clap::Parser;

/// Protocol-translating LLM proxy
#[derive(Debug, Parser)]
#[command(name = "manifold", version, about)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "MANIFOLD_CONFIG", default_value = "manifold.toml")]
    pub config: PathBuf,

    /// Log filter (tracing env-filter syntax)
    #[arg(long, env = "MANIFOLD_LOG", default_value = "info")]
    pub log: String,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check: bool,
}
