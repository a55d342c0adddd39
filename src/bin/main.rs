//! Sparsedit binary.
//!
//! Entry point for editing a causal language model with a sparsified LoRA
//! adapter and for inspecting the sparsity schedule.

use clap::Parser;
use sparsedit_core::cli::{commands::Commands, handle_edit, handle_schedule};
use sparsedit_core::config::{ConfigOverrides, EditConfig};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration errors are reported by the command handler once logging is up
    let configured = EditConfig::load(cli.command.config_path(), &ConfigOverrides::default())
        .map(|config| config.logging)
        .unwrap_or_default();
    let logging = cli.command.logging();
    let level = logging.get_effective_level(&configured.level);
    let filter = logging.filter_directives(&configured);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.parse().unwrap_or(Level::INFO).into())
                .parse_lossy(&filter),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Sparsedit starting up");

    match cli.command {
        Commands::Edit(cmd) => handle_edit(cmd)?,
        Commands::Schedule(cmd) => handle_schedule(cmd)?,
    }

    Ok(())
}
