//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Aggregating MCP gateway: stdio backends behind one authenticated endpoint.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "SWITCHBOARD_CONFIG", default_value = "switchboard.json")]
    pub config: PathBuf,

    /// Log at debug level regardless of SWITCHBOARD_LOG / RUST_LOG.
    #[arg(short, long)]
    pub verbose: bool,
}
