//! codelore CLI: scan a codebase and grow a local knowledge graph.
//!
//! Runs the discovery pipeline once or continuously (auto-evolve), and
//! queries the resulting concepts and relationships.

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
