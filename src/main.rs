mod cache;
mod cli;
mod config;
mod error;
mod git;
mod models;
mod providers;
mod ratelimit;
mod tui;
mod utils;

use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

/// Once the TUI owns the terminal, stderr logging would corrupt the
/// screen, so route the log to a file under the user cache directory.
fn init_logging() {
    if std::io::stderr().is_terminal() {
        if let Some(cache_dir) = dirs::cache_dir() {
            let dir = cache_dir.join("ciwatch");
            if std::fs::create_dir_all(&dir).is_ok() {
                if let Ok(file) = std::fs::File::create(dir.join("ciwatch.log")) {
                    env_logger::Builder::from_default_env()
                        .target(env_logger::Target::Pipe(Box::new(file)))
                        .init();
                    return;
                }
            }
        }
    }
    env_logger::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    info!("starting ciwatch {}", env!("CARGO_PKG_VERSION"));
    cli.execute().await?;

    Ok(())
}
