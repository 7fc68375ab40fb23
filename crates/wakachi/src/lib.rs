//! # Wakachi
//!
//! Multi-word token expansion for CoNLL-U corpora. Splits surface tokens
//! such as French "du" into their syntactic words ("de le") with either a
//! frequency dictionary or a character-level seq2seq model.
//!
//! This crate re-exports [`wakachi_core`] (data model, vocabulary,
//! configuration and scoring) and [`wakachi_trainer`] (expanders and the
//! training loop).
//!
//! ```no_run
//! use wakachi::{MwtConfig, Orchestrator, RunPaths, Strategy, TrainOutcome};
//!
//! # fn main() -> anyhow::Result<()> {
//! let paths = RunPaths {
//!     train_file: "data/mwt/fr.train.conllu".into(),
//!     eval_file: "data/mwt/fr.dev.conllu".into(),
//!     output_file: "data/mwt/fr.dev.pred.conllu".into(),
//!     gold_file: "data/mwt/fr.dev.conllu".into(),
//!     save_dir: "saved_models/mwt".into(),
//!     save_name: None,
//!     preset_dir: None,
//! };
//! let config = MwtConfig::new("fr").with_strategy(Strategy::Dictionary);
//! if let TrainOutcome::Trained(report) = Orchestrator::new(paths).train(config, false)? {
//!     println!("dev F1 {:.2}", report.best_score * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

pub use wakachi_core::*;
pub use wakachi_trainer::{
    Batch, BatchProvider, DictTrainer, EvalReport, Expander, Orchestrator, PresetRecord,
    PresetStore, RunPaths, Seq2SeqTrainer, TrainOutcome, TrainReport, TrainingState,
    build_expander, read_vocab,
};
