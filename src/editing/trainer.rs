//! Sparsified LoRA edit trainer
//!
//! One run: attach (or reuse) an adapter, then for each iteration train on
//! every micro-batch of requests, folding gradients into the importance
//! estimates before each optimizer step and pruning the adapter afterwards
//! whenever the schedule's rate is below 1.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tch::nn::{self, OptimizerConfig};
use tch::Device;

use super::batching::{chunks, EditBatch};
use super::importance::{density, ImportanceScores};
use super::loss::masked_lm_loss;
use super::meter::AverageMeter;
use super::request::{prepare_requests, EditRequest};
use super::schedule::{SchedulePhase, SparsitySchedule};
use super::EditFailure;
use crate::config::{EditConfig, HyperParams};
use crate::error::{EditError, Result};
use crate::lora::{EditTarget, LoraAdapter, PeftModel};
use crate::model::CausalLm;
use crate::tokenizer::BatchTokenizer;

/// Summary of one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationStats {
    pub iteration: usize,
    pub phase: SchedulePhase,
    pub rate: f64,
    /// Batch-size weighted mean loss over the iteration's micro-batches
    pub avg_loss: f64,
    /// Fraction of non-zero adapter entries after the iteration
    pub density: f64,
}

/// What a run did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditReport {
    pub iterations: Vec<IterationStats>,
    pub stopped_early: bool,
}

impl EditReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.iterations.last().map(|stats| stats.avg_loss)
    }

    pub fn final_rate(&self) -> Option<f64> {
        self.iterations.last().map(|stats| stats.rate)
    }
}

pub struct EditTrainer {
    hparams: HyperParams,
    schedule: SparsitySchedule,
    show_progress: bool,
}

impl EditTrainer {
    /// Validate the configuration and build a trainer
    ///
    /// An unsupported `lora_type` fails here, before any model is touched.
    pub fn new(config: &EditConfig) -> Result<Self> {
        config.hparams.ensure_supported()?;
        config.validate()?;
        Ok(Self {
            hparams: config.hparams.clone(),
            schedule: SparsitySchedule::from(&config.schedule),
            show_progress: config.logging.progress,
        })
    }

    pub fn hparams(&self) -> &HyperParams {
        &self.hparams
    }

    pub fn schedule(&self) -> &SparsitySchedule {
        &self.schedule
    }

    /// Put the model in training configuration and attach the adapter
    ///
    /// A continuing model keeps its adapter unless `keep_original_weight` is
    /// set, in which case the adapter is dropped and a fresh one is wrapped
    /// around the base. The new adapter is built before the target is taken
    /// apart, so a failure hands the target back unchanged.
    pub fn prepare_model<M: CausalLm>(
        &self,
        target: EditTarget<M>,
        keep_original_weight: bool,
    ) -> std::result::Result<PeftModel<M>, EditFailure<M>> {
        let mut peft = match target {
            EditTarget::Continuing(mut peft) if !keep_original_weight => {
                tracing::info!("Continuing training of the existing adapter");
                enable_training(peft.base_mut());
                peft
            }
            target => {
                let base = target.base();
                let adapter =
                    match LoraAdapter::new(self.hparams.lora_config(), base.dims(), base.device()) {
                        Ok(adapter) => adapter,
                        Err(error) => return Err(EditFailure::new(error, target)),
                    };
                if target.is_wrapped() {
                    tracing::info!("Discarding the existing adapter, wrapping a fresh one");
                }
                let mut base = target.into_base();
                enable_training(&mut base);
                PeftModel::with_adapter(base, adapter)
            }
        };

        peft.is_parallelizable = true;
        peft.model_parallel = true;
        Ok(peft)
    }

    /// Deep-copy `requests`, apply the leading-space rule and tokenize them
    /// into order-preserving micro-batches
    pub fn build_batches<T: BatchTokenizer + ?Sized>(
        &self,
        tokenizer: &T,
        requests: &[EditRequest],
        device: Device,
    ) -> Result<Vec<EditBatch>> {
        let requests = prepare_requests(requests);
        chunks(&requests, self.hparams.batch_size)
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                EditBatch::build(tokenizer, chunk, i * self.hparams.batch_size, device)
            })
            .collect()
    }

    /// Train `model` on `requests`, mutating its adapter in place
    pub fn run<M: CausalLm, T: BatchTokenizer + ?Sized>(
        &self,
        model: &mut PeftModel<M>,
        tokenizer: &T,
        requests: &[EditRequest],
    ) -> Result<EditReport> {
        let batches = self.build_batches(tokenizer, requests, model.base().device())?;
        self.train(model, &batches)
    }

    /// The iteration loop over prepared batches
    ///
    /// On error the adapter holds the values of the last completed step.
    pub fn train<M: CausalLm>(
        &self,
        model: &mut PeftModel<M>,
        batches: &[EditBatch],
    ) -> Result<EditReport> {
        let mut report = EditReport::default();
        if batches.is_empty() {
            tracing::warn!("No edit requests given, nothing to train");
            return Ok(report);
        }
        let num_requests: usize = batches.iter().map(EditBatch::size).sum();

        let params = model.named_parameters();
        let mut optimizer = nn::Adam {
            beta1: 0.9,
            beta2: 0.999,
            wd: self.hparams.weight_decay,
            eps: 1e-8,
            amsgrad: false,
        }
        .build(model.adapter().var_store(), self.hparams.lr)?;

        tracing::info!(
            "Editing {} requests in {} batches for up to {} iterations ({} adapter tensors)",
            num_requests,
            batches.len(),
            self.hparams.num_steps,
            params.len()
        );

        let mut scores = ImportanceScores::default();
        let mut meter = AverageMeter::new();
        let progress = self.progress_bar();

        for it in 0..self.hparams.num_steps {
            meter.reset();
            let rate = self.schedule.rate(it);

            for batch in batches {
                optimizer.zero_grad();

                let logits = model.forward_t(&batch.input_ids, &batch.attention_mask, true)?;
                let loss = masked_lm_loss(&logits, batch)?;
                let loss_value = loss.double_value(&[]);
                if !loss_value.is_finite() {
                    progress.abandon();
                    return Err(EditError::NonFiniteLoss {
                        iteration: it,
                        loss: loss_value,
                    });
                }
                meter.update(loss_value, batch.size());

                loss.backward();
                scores.observe(&params);
                optimizer.step();

                if rate < 1.0 {
                    scores.prune(&params, rate)?;
                }

                tracing::debug!(
                    "iteration {} batch {:?}: loss {:.4}, rate {:.3}",
                    it,
                    batch.indices,
                    loss_value,
                    rate
                );
            }

            report.iterations.push(IterationStats {
                iteration: it,
                phase: self.schedule.phase(it),
                rate,
                avg_loss: meter.avg,
                density: density(&params),
            });
            progress.set_message(format!("rate: {:.3} loss: {:.3}", rate, meter.avg));
            progress.inc(1);

            if self.schedule.should_stop(it, meter.avg) {
                tracing::info!(
                    "Stopping after iteration {}: average loss {:.4} below threshold",
                    it,
                    meter.avg
                );
                report.stopped_early = true;
                break;
            }
        }

        progress.finish();
        if let Some(loss) = report.final_loss() {
            tracing::info!(
                "Edit finished after {} iterations, final loss {:.4}",
                report.iterations.len(),
                loss
            );
        }
        Ok(report)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.hparams.num_steps as u64);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

/// Cache off, gradient checkpointing on, input gradients on
fn enable_training<M: CausalLm>(model: &mut M) {
    model.set_use_cache(false);
    model.gradient_checkpointing_enable();
    model.enable_input_require_grads();
}
