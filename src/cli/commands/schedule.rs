use clap::Args;
use std::path::PathBuf;

use super::LoggingArgs;

#[derive(Debug, Args)]
pub struct ScheduleCommand {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of iterations to print (defaults to hparams.num_steps)
    #[arg(long)]
    pub steps: Option<usize>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}
