mod cli;
mod dedup;
mod engine;
mod model;
mod orchestrator;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use model::TerminalStatus;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Fall back to `warn` if RUST_LOG is unset or invalid.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args = cli::Cli::parse();
    let is_json = args.json;

    match cli::run(args).await {
        // A followed run that ended in failure is reported through the exit code.
        Ok(Some(TerminalStatus::Failure)) => std::process::exit(2),
        // Exit explicitly: a pending stdin read would otherwise hold the runtime open.
        Ok(_) => std::process::exit(0),
        Err(e) => {
            if is_json {
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
