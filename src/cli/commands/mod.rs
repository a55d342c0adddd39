pub mod edit;
pub mod logging;
pub mod schedule;

pub use edit::EditCommand;
pub use logging::LoggingArgs;
pub use schedule::ScheduleCommand;

use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum Commands {
    /// Write facts into a model by training a sparsified LoRA adapter
    Edit(EditCommand),
    /// Print the sparsity rate for each iteration of the configured schedule
    Schedule(ScheduleCommand),
}

impl Commands {
    pub fn logging(&self) -> &LoggingArgs {
        match self {
            Commands::Edit(cmd) => &cmd.logging,
            Commands::Schedule(cmd) => &cmd.logging,
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        match self {
            Commands::Edit(cmd) => cmd.config.as_deref(),
            Commands::Schedule(cmd) => cmd.config.as_deref(),
        }
    }
}
