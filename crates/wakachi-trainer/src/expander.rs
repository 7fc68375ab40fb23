//! The trainer abstraction shared by both expansion strategies.

use std::path::Path;

use anyhow::Result;
use wakachi_core::{MwtConfig, Strategy, Vocab};

use crate::data::Batch;
use crate::dictionary::DictTrainer;
use crate::seq2seq::Seq2SeqTrainer;

/// A trainable MWT expander.
///
/// The training loop is written once against this trait. Iterative
/// expanders run the epoch loop with checkpoint selection and learning-rate
/// decay; non-iterative ones are fit in a single pass.
pub trait Expander {
    fn strategy(&self) -> Strategy;

    /// Whether repeated passes over the training data change the model.
    fn is_iterative(&self) -> bool;

    /// Learn from one training batch and return its loss.
    fn update(&mut self, batch: &Batch) -> Result<f32>;

    /// Expansions for every source in `batch`, in batch order.
    fn predict(&self, batch: &Batch) -> Result<Vec<Vec<String>>>;

    /// Set the learning rate without resetting optimizer state.
    fn change_lr(&mut self, lr: f64) -> Result<()>;

    /// Persist everything needed to reproduce predictions.
    fn save(&self, path: &Path) -> Result<()>;

    /// Restore state written by [`Expander::save`].
    fn load(&mut self, path: &Path) -> Result<()>;
}

/// Construct the expander selected by `config.strategy`.
pub fn build_expander(config: &MwtConfig, vocab: &Vocab) -> Result<Box<dyn Expander>> {
    Ok(match config.strategy {
        Strategy::Dictionary => Box::new(DictTrainer::new()),
        Strategy::Sequence => Box::new(Seq2SeqTrainer::new(config.clone(), vocab.clone())?),
    })
}
