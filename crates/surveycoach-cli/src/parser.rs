//! Root CLI parser and global options.

use clap::Parser;

use crate::commands::Commands;

/// Evaluate survey answers with a local model.
#[derive(Parser)]
#[command(name = "surveycoach")]
#[command(about = "Stream model feedback on survey answers")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}
