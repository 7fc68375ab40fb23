//! # Wakachi Core
//!
//! Data model and pure logic for multi-word token (MWT) expansion: the
//! CoNLL-U candidate source, the character vocabulary, run configuration and
//! the exact-match expansion scorer.
//!
//! ## Quick Start
//!
//! ```rust
//! use wakachi_core::{Document, score_documents};
//!
//! let gold = Document::parse("1-2\tdu\t_\t_\t_\t_\t_\t_\t_\t_\n1\tde\t_\t_\t_\t_\t_\t_\t_\t_\n2\tle\t_\t_\t_\t_\t_\t_\t_\t_\n").unwrap();
//! let system = gold.with_expansions(&[vec!["de".into(), "le".into()]]).unwrap();
//!
//! let score = score_documents(&system, &gold).unwrap();
//! assert_eq!(score.f1, 1.0);
//! ```
pub mod config;
pub mod conllu;
pub mod error;
pub mod persist;
pub mod scoring;
pub mod vocab;

// Re-export primary API
pub use config::{
    AttentionType, Enc2Dec, Hyperparameters, ModelConfig, MwtConfig, OptimConfig, OptimizerKind,
    Strategy,
};
pub use conllu::{Candidate, ConlluReader, Document, Sentence, Token};
pub use error::{Result, WakachiError};
pub use scoring::{Score, score, score_documents};
pub use vocab::Vocab;
