//! Knowledge editing by sparsified low-rank adaptation
//!
//! [`apply_edits`] is the entry point: it validates the configuration,
//! optionally snapshots the model, attaches or reuses an adapter and runs the
//! [`EditTrainer`] loop. The pieces are usable on their own:
//!
//! - `request`: edit requests and the leading-space rule
//! - `batching`: chunking, prompt lengths and the target-span label mask
//! - `loss`: masked next-token cross-entropy
//! - `schedule`: the three-phase sparsity rate
//! - `importance`: EMA importance scores and pruning
//! - `meter`: running loss average
//! - `trainer`: setup and the training loop

pub mod batching;
pub mod importance;
pub mod loss;
pub mod meter;
pub mod request;
pub mod schedule;
pub mod trainer;

pub use batching::{chunks, EditBatch};
pub use importance::ImportanceScores;
pub use meter::AverageMeter;
pub use request::{load_requests, prepare_requests, EditRequest};
pub use schedule::{SchedulePhase, SparsitySchedule};
pub use trainer::{EditReport, EditTrainer, IterationStats};

use std::fmt;

use crate::config::EditConfig;
use crate::error::EditError;
use crate::lora::{EditTarget, PeftModel};
use crate::model::{CausalLm, WeightSnapshot};
use crate::tokenizer::BatchTokenizer;

/// Result of [`apply_edits`]
pub struct EditOutcome<M: CausalLm> {
    /// The adapter-wrapped, edited model
    pub model: PeftModel<M>,
    /// Pre-edit weights, when a copy was requested; the caller owns them
    pub original: Option<WeightSnapshot>,
    pub report: EditReport,
}

/// A failed [`apply_edits`] call, handing the model back
///
/// `target` is untouched when validation or tokenization failed. Once
/// training started it is wrapped, with the adapter as the last completed
/// step left it.
pub struct EditFailure<M: CausalLm> {
    pub error: EditError,
    pub target: EditTarget<M>,
    pub original: Option<WeightSnapshot>,
}

impl<M: CausalLm> EditFailure<M> {
    pub fn new(error: EditError, target: EditTarget<M>) -> Self {
        Self {
            error,
            target,
            original: None,
        }
    }

    pub fn into_error(self) -> EditError {
        self.error
    }
}

impl<M: CausalLm> fmt::Debug for EditFailure<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditFailure")
            .field("error", &self.error)
            .field("wrapped", &self.target.is_wrapped())
            .field("original", &self.original.is_some())
            .finish()
    }
}

impl<M: CausalLm> fmt::Display for EditFailure<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<M: CausalLm> std::error::Error for EditFailure<M> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<M: CausalLm> From<EditFailure<M>> for EditError {
    fn from(failure: EditFailure<M>) -> Self {
        failure.error
    }
}

/// Edit `target` so that each request's prompt continues with its target
///
/// With `copy`, the weights are deep-copied before anything changes. With
/// `keep_original_weight`, a model that already carries an adapter gets a
/// fresh one instead of continuing the old.
///
/// Configuration, adapter shape and every request's target span are checked
/// before the first optimizer step. On any error the model comes back inside
/// the [`EditFailure`].
pub fn apply_edits<M: CausalLm, T: BatchTokenizer + ?Sized>(
    target: EditTarget<M>,
    tokenizer: &T,
    requests: &[EditRequest],
    config: &EditConfig,
    copy: bool,
    keep_original_weight: bool,
) -> Result<EditOutcome<M>, EditFailure<M>> {
    let trainer = match EditTrainer::new(config) {
        Ok(trainer) => trainer,
        Err(error) => return Err(EditFailure::new(error, target)),
    };
    let batches = match trainer.build_batches(tokenizer, requests, target.base().device()) {
        Ok(batches) => batches,
        Err(error) => return Err(EditFailure::new(error, target)),
    };
    let original = copy.then(|| target.snapshot());

    let mut model = match trainer.prepare_model(target, keep_original_weight) {
        Ok(model) => model,
        Err(mut failure) => {
            failure.original = original;
            return Err(failure);
        }
    };

    match trainer.train(&mut model, &batches) {
        Ok(report) => Ok(EditOutcome {
            model,
            original,
            report,
        }),
        Err(error) => Err(EditFailure {
            error,
            target: EditTarget::Continuing(model),
            original,
        }),
    }
}
