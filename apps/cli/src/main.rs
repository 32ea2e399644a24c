//! leadharvest CLI: resumable lead harvesting from a public licensee directory.
//!
//! Sweeps the directory by name prefix, deduplicates listings into a local
//! database with change history, and enriches them with best-effort contact
//! details.

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
