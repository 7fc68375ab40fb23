//! # Expander Configuration
//!
//! Hyperparameters and run options shared by both expansion strategies.
//! A `MwtConfig` is built once per process from defaults, command-line
//! overrides and, optionally, a stored preset, then persisted next to the
//! trained model so evaluation can rebuild exactly the same trainer.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WakachiError};
use crate::persist::write_atomic;

/// Which expander implementation a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Frequency-majority lookup table.
    Dictionary,
    /// Character-level encoder-decoder.
    #[default]
    Sequence,
}

/// Attention scoring function used by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionType {
    /// Dot product between decoder state and encoder outputs.
    #[default]
    Soft,
    /// Additive (concat) attention.
    Mlp,
    /// Bilinear attention.
    Linear,
    /// Dot product against a two-layer transformed query.
    Deep,
}

/// Transformation applied to the encoder's final hidden state before it
/// seeds the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enc2Dec {
    /// Pass the encoder state through unchanged.
    #[default]
    No,
    Linear,
    Nonlinear,
    /// Start the decoder from zeros.
    Zero,
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
    Adamw,
}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $(Self::$variant => $name,)+
                };
                f.write_str(name)
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} '{}', expected one of: {}",
                        stringify!($ty),
                        other,
                        [$($name),+].join(", ")
                    )),
                }
            }
        }
    };
}

string_enum!(Strategy { Dictionary => "dictionary", Sequence => "sequence" });
string_enum!(AttentionType { Soft => "soft", Mlp => "mlp", Linear => "linear", Deep => "deep" });
string_enum!(Enc2Dec { No => "no", Linear => "linear", Nonlinear => "nonlinear", Zero => "zero" });
string_enum!(OptimizerKind { Sgd => "sgd", Adam => "adam", Adamw => "adamw" });

/// Options that determine the shape and decoding behaviour of the
/// sequence model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_dim: usize,
    pub emb_dim: usize,
    pub num_layers: usize,
    pub emb_dropout: f32,
    pub dropout: f32,
    /// Upper bound on decoded characters per token.
    pub max_dec_len: usize,
    pub beam_size: usize,
    pub attn_type: AttentionType,
    pub enc2dec: Enc2Dec,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 100,
            emb_dim: 50,
            num_layers: 1,
            emb_dropout: 0.5,
            dropout: 0.5,
            max_dec_len: 50,
            beam_size: 1,
            attn_type: AttentionType::Soft,
            enc2dec: Enc2Dec::No,
        }
    }
}

/// Options for the optimisation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    /// Fraction of training examples kept after shuffling.
    pub sample_train: f64,
    pub optim: OptimizerKind,
    pub lr: f64,
    pub lr_decay: f64,
    /// Decay is only considered after this epoch.
    pub decay_epoch: usize,
    pub num_epoch: usize,
    pub batch_size: usize,
    pub max_grad_norm: f64,
    /// Emit a progress record every `log_step` updates.
    pub log_step: usize,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            sample_train: 1.0,
            optim: OptimizerKind::Adam,
            lr: 1e-3,
            lr_decay: 0.9,
            decay_epoch: 30,
            num_epoch: 30,
            batch_size: 50,
            max_grad_norm: 5.0,
            log_step: 20,
        }
    }
}

/// The tunable part of a configuration; this is what presets store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub model: ModelConfig,
    pub optim: OptimConfig,
}

/// Full configuration for one language's expander.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MwtConfig {
    pub lang: String,
    pub strategy: Strategy,
    pub hyper: Hyperparameters,
    /// Size of the vocabulary the model was built with; set once training
    /// data has been loaded.
    #[serde(default)]
    pub vocab_size: Option<usize>,
    /// Checkpoint written by training and read back by evaluation.
    #[serde(default)]
    pub model_file: Option<PathBuf>,
    /// Seed for shuffling and subsampling the training data.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Ignore CUDA even when available.
    #[serde(default)]
    pub cpu: bool,
}

fn default_seed() -> u64 {
    1234
}

impl MwtConfig {
    /// Create a configuration with default hyperparameters.
    pub fn new(lang: impl Into<String>) -> Self {
        Self {
            lang: lang.into(),
            strategy: Strategy::default(),
            hyper: Hyperparameters::default(),
            vocab_size: None,
            model_file: None,
            seed: default_seed(),
            cpu: false,
        }
    }

    /// Set the expansion strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replace all hyperparameters.
    pub fn with_hyperparameters(mut self, hyper: Hyperparameters) -> Self {
        self.hyper = hyper;
        self
    }

    /// Set the number of training epochs.
    pub fn with_epochs(mut self, num_epoch: usize) -> Self {
        self.hyper.optim.num_epoch = num_epoch;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.hyper.optim.batch_size = batch_size;
        self
    }

    /// Set the initial learning rate.
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.hyper.optim.lr = lr;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Run on the CPU even when CUDA is available.
    pub fn with_cpu(mut self, cpu: bool) -> Self {
        self.cpu = cpu;
        self
    }

    /// Set the model file path.
    pub fn with_model_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_file = Some(path.into());
        self
    }

    pub fn model(&self) -> &ModelConfig {
        &self.hyper.model
    }

    pub fn optim(&self) -> &OptimConfig {
        &self.hyper.optim
    }

    /// Reject values the trainers cannot work with.
    pub fn validate(&self) -> Result<()> {
        let m = &self.hyper.model;
        let o = &self.hyper.optim;

        if o.batch_size == 0 {
            return Err(WakachiError::InvalidConfig("batch_size must be > 0".into()));
        }
        if o.num_epoch == 0 {
            return Err(WakachiError::InvalidConfig("num_epoch must be > 0".into()));
        }
        if !(o.sample_train > 0.0 && o.sample_train <= 1.0) {
            return Err(WakachiError::InvalidConfig(format!(
                "sample_train must be in (0, 1], got {}",
                o.sample_train
            )));
        }
        if !(o.lr > 0.0) {
            return Err(WakachiError::InvalidConfig(format!(
                "lr must be positive, got {}",
                o.lr
            )));
        }
        if o.log_step == 0 {
            return Err(WakachiError::InvalidConfig("log_step must be > 0".into()));
        }
        if self.strategy == Strategy::Sequence {
            if m.hidden_dim == 0 || m.emb_dim == 0 || m.num_layers == 0 {
                return Err(WakachiError::InvalidConfig(
                    "hidden_dim, emb_dim and num_layers must be > 0".into(),
                ));
            }
            if m.beam_size == 0 || m.max_dec_len == 0 {
                return Err(WakachiError::InvalidConfig(
                    "beam_size and max_dec_len must be > 0".into(),
                ));
            }
            for (name, p) in [("emb_dropout", m.emb_dropout), ("dropout", m.dropout)] {
                if !(0.0..1.0).contains(&p) {
                    return Err(WakachiError::InvalidConfig(format!(
                        "{name} must be in [0, 1), got {p}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fail when the vocabulary in use differs from the one recorded at
    /// training time. Embedding and output layers are sized by it.
    pub fn ensure_vocab_compatible(&self, found: usize) -> Result<()> {
        match self.vocab_size {
            Some(expected) if expected != found => {
                Err(WakachiError::VocabMismatch { expected, found })
            }
            _ => Ok(()),
        }
    }

    /// Persist as pretty JSON, replacing any previous file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Load a configuration previously written by [`MwtConfig::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| WakachiError::io(path, e))?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
