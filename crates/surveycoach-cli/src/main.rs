//! CLI entry point.

use clap::Parser;
use surveycoach_cli::{Cli, Commands, handlers, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Ask {
            config,
            node,
            question,
            answer,
            timeout_secs,
            records,
            server_path,
            ctx_size,
        } => {
            handlers::ask::execute(handlers::ask::AskArgs {
                config,
                node,
                question,
                answer,
                timeout_secs,
                records,
                server_path,
                ctx_size,
            })
            .await
        }
        Commands::CheckConfig { config } => handlers::check_config::execute(&config),
    }
}
