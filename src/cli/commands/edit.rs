use clap::Args;
use std::path::PathBuf;

use super::LoggingArgs;
use crate::config::ConfigOverrides;

#[derive(Debug, Args)]
pub struct EditCommand {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model directory holding config.json, model.safetensors and tokenizer.json
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// JSON array of {"prompt", "target_new"} objects
    #[arg(short, long)]
    pub requests: PathBuf,

    /// Adapter from an earlier edit to continue from
    #[arg(long)]
    pub adapter: Option<PathBuf>,

    /// Where to write the trained adapter (safetensors)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of training iterations
    #[arg(long)]
    pub steps: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Accelerator index
    #[arg(long)]
    pub device: Option<usize>,

    /// Start from the base weights even when --adapter is given
    #[arg(long)]
    pub keep_original_weight: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl EditCommand {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model_path: self.model.clone(),
            num_steps: self.steps,
            lr: self.lr,
            device: self.device,
            progress: self.no_progress.then_some(false),
        }
    }
}
