//! Showrunner CLI: produce weekly scripture study episodes.
//!
//! Retrieves commentary for the week's passages, writes a grounded script,
//! narrates it, and renders the video, resuming from checkpoints when a
//! previous run stopped partway.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
