use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::cli::commands::{EditCommand, ScheduleCommand};
use crate::config::{ConfigOverrides, EditConfig};
use crate::editing::{apply_edits, load_requests, EditFailure, SparsitySchedule};
use crate::lora::{EditTarget, PeftModel};
use crate::model::SmallTransformer;
use crate::tokenizer::HfTokenizer;

pub fn handle_edit(cmd: EditCommand) -> Result<()> {
    let config = EditConfig::load(cmd.config.as_deref(), &cmd.overrides())
        .context("Failed to load configuration")?;
    let device = config.hparams.torch_device();

    let model = SmallTransformer::load(&config.model.path, device)
        .with_context(|| format!("Failed to load model from {}", config.model.path.display()))?;
    let tokenizer = HfTokenizer::from_file(
        &config.model.tokenizer_file(),
        &config.model.pad_token,
        config.model.padding_side,
        config.model.add_special_tokens,
    )
    .context("Failed to load tokenizer")?;
    let requests = load_requests(&cmd.requests)
        .with_context(|| format!("Failed to read requests from {}", cmd.requests.display()))?;

    let target = match &cmd.adapter {
        Some(path) => {
            let mut peft = PeftModel::wrap(model, config.hparams.lora_config())?;
            let loaded = peft
                .adapter_mut()
                .load_safetensors(path)
                .with_context(|| format!("Failed to load adapter from {}", path.display()))?;
            ensure_adapter_loaded(loaded, peft.named_parameters().len(), path)?;
            EditTarget::Continuing(peft)
        }
        None => EditTarget::Fresh(model),
    };

    info!("Applying {} edits", requests.len());
    let outcome = apply_edits(
        target,
        &tokenizer,
        &requests,
        &config,
        false,
        cmd.keep_original_weight,
    )
    .map_err(EditFailure::into_error)?;

    if let Some(path) = &cmd.output {
        outcome
            .model
            .adapter()
            .save_safetensors(path)
            .with_context(|| format!("Failed to write adapter to {}", path.display()))?;
    }

    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(())
}

/// A continued edit needs at least one tensor from the adapter file
fn ensure_adapter_loaded(loaded: usize, expected: usize, path: &Path) -> Result<()> {
    if loaded == 0 {
        anyhow::bail!(
            "Adapter file {} has no tensors matching the configured target modules and layers",
            path.display()
        );
    }
    if loaded < expected {
        warn!(
            "Adapter file {} covers {} of {} adapter tensors, the rest start fresh",
            path.display(),
            loaded,
            expected
        );
    }
    Ok(())
}

pub fn handle_schedule(cmd: ScheduleCommand) -> Result<()> {
    let config = EditConfig::load(cmd.config.as_deref(), &ConfigOverrides::default())
        .context("Failed to load configuration")?;
    let schedule = SparsitySchedule::from(&config.schedule);
    let steps = cmd.steps.unwrap_or(config.hparams.num_steps);

    println!("{:>9}  {:<6}  {:>6}", "iteration", "phase", "rate");
    for it in 0..steps {
        println!(
            "{:>9}  {:<6}  {:>6.4}",
            it,
            schedule.phase(it),
            schedule.rate(it)
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_adapter_file_is_rejected() {
        let path = Path::new("adapter.safetensors");
        let err = ensure_adapter_loaded(0, 8, path).unwrap_err();
        assert!(err.to_string().contains("adapter.safetensors"));
        assert!(ensure_adapter_loaded(4, 8, path).is_ok());
        assert!(ensure_adapter_loaded(8, 8, path).is_ok());
    }
}
