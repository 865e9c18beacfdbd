mod cli;
mod engine;
mod error;
mod model;
mod orchestrator;
mod storage;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_non_tui = args.json || args.text;

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
