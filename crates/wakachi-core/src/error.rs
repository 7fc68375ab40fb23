use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during Wakachi core operations.
#[derive(Debug, Error)]
pub enum WakachiError {
    /// A file could not be read or written.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// The file being accessed.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A CoNLL-U line could not be interpreted.
    #[error("malformed CoNLL-U at line {line}: {reason}")]
    MalformedConllu {
        /// 1-based line number in the source file.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },

    /// System output and gold reference do not share the same token layout.
    #[error("system and gold files are misaligned at sentence {sentence}: {reason}")]
    Alignment {
        /// 0-based sentence index.
        sentence: usize,
        /// Which count disagreed.
        reason: String,
    },

    /// The number of predictions does not match the number of candidates.
    #[error("expected {expected} predicted expansions, got {found}")]
    PredictionCount {
        /// Number of expansion candidates in the document.
        expected: usize,
        /// Number of predictions supplied.
        found: usize,
    },

    /// The vocabulary in use disagrees with the one the model was built for.
    #[error("vocabulary size mismatch: model expects {expected}, found {found}")]
    VocabMismatch {
        /// Size recorded with the model or configuration.
        expected: usize,
        /// Size of the vocabulary being used.
        found: usize,
    },

    /// A checkpoint does not contain a parameter the model requires.
    #[error("checkpoint {path:?} is missing parameter {name}")]
    MissingParameter {
        /// Checkpoint file.
        path: PathBuf,
        /// Parameter name.
        name: String,
    },

    /// A checkpoint parameter has a different shape than the model.
    #[error("parameter {name} has shape {found:?} in checkpoint, model expects {expected:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Shape of the freshly constructed model.
        expected: Vec<usize>,
        /// Shape stored in the checkpoint.
        found: Vec<usize>,
    },

    /// A configuration value is out of range or not supported.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A regex pattern failed to compile (should not happen with static patterns).
    #[error("regex compilation error: {0}")]
    RegexError(#[from] regex::Error),
}

impl WakachiError {
    /// Wrap an I/O error together with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for Wakachi operations.
pub type Result<T> = std::result::Result<T, WakachiError>;
