//! # Wakachi Trainer
//!
//! Multi-word token expanders and the loop that trains and evaluates them.
//! A frequency dictionary and a character seq2seq model share the
//! [`Expander`] trait; the [`Orchestrator`] drives either one through
//! training, dev scoring, checkpoint selection and learning-rate decay.

pub mod data;
pub mod dictionary;
pub mod expander;
pub mod model;
pub mod orchestrator;
pub mod preset;
pub mod seq2seq;
pub mod state;

pub use data::{Batch, BatchProvider};
pub use dictionary::DictTrainer;
pub use expander::{Expander, build_expander};
pub use orchestrator::{EvalReport, Orchestrator, RunPaths, TrainOutcome, TrainReport};
pub use preset::{PresetRecord, PresetStore};
pub use seq2seq::{Seq2SeqTrainer, read_vocab};
pub use state::TrainingState;
