//! Subcommands.

use std::path::PathBuf;

use clap::Subcommand;
use surveycoach_runtime::llama::DEFAULT_CONTEXT_SIZE;

/// Default llama-server binary, resolved through `PATH`.
pub const DEFAULT_SERVER_PATH: &str = "llama-server";

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate one answer and stream the model's feedback
    Ask {
        /// Inference config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Survey node the answer belongs to
        #[arg(long)]
        node: String,
        /// Question shown to the respondent
        #[arg(short, long)]
        question: String,
        /// The respondent's answer
        #[arg(short, long)]
        answer: String,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
        /// Append answer and transcript records to this JSONL file
        #[arg(long)]
        records: Option<PathBuf>,
        /// llama-server binary
        #[arg(long, env = "SURVEYCOACH_LLAMA_SERVER", default_value = DEFAULT_SERVER_PATH)]
        server_path: PathBuf,
        /// Context window in tokens
        #[arg(long, default_value_t = DEFAULT_CONTEXT_SIZE)]
        ctx_size: u32,
    },

    /// Load a config, apply environment overrides and print the result
    CheckConfig {
        /// Inference config (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}
