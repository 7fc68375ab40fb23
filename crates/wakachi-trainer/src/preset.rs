//! Per-language store of best-known hyperparameters.
//!
//! One `{lang}.json` file per language holds the hyperparameters of the
//! best run so far and the dev F1 (in percent) it reached. Records only
//! ever move up: an update with a score that does not beat the stored one
//! is ignored.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use wakachi_core::persist::write_atomic;
use wakachi_core::{Hyperparameters, MwtConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetRecord {
    /// Dev F1 in percent.
    pub score: f64,
    pub hyperparameters: Hyperparameters,
}

#[derive(Debug, Clone)]
pub struct PresetStore {
    dir: PathBuf,
}

impl PresetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, lang: &str) -> PathBuf {
        self.dir.join(format!("{lang}.json"))
    }

    /// The stored record for `lang`, if any.
    pub fn get(&self, lang: &str) -> Result<Option<PresetRecord>> {
        let path = self.path(lang);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("reading preset {}", path.display()))?;
        let record = serde_json::from_str(&json)
            .with_context(|| format!("parsing preset {}", path.display()))?;
        Ok(Some(record))
    }

    /// Overwrite `config`'s hyperparameters with the stored preset.
    /// Returns whether a preset was found.
    pub fn apply(&self, config: &mut MwtConfig) -> Result<bool> {
        match self.get(&config.lang)? {
            Some(record) => {
                tracing::info!(
                    "Using {} preset (dev F1 {:.2}) from {}",
                    config.lang,
                    record.score,
                    self.dir.display()
                );
                config.hyper = record.hyperparameters;
                Ok(true)
            }
            None => {
                tracing::warn!("No preset for {} in {}", config.lang, self.dir.display());
                Ok(false)
            }
        }
    }

    /// Record `hyper` for `lang` if `score` beats the stored score.
    /// Returns whether the store was written.
    pub fn update(&self, lang: &str, hyper: &Hyperparameters, score: f64) -> Result<bool> {
        if let Some(current) = self.get(lang)? {
            if score <= current.score {
                tracing::info!(
                    "Keeping {} preset: {:.2} does not beat stored {:.2}",
                    lang,
                    score,
                    current.score
                );
                return Ok(false);
            }
        }
        let record = PresetRecord {
            score,
            hyperparameters: hyper.clone(),
        };
        write_atomic(&self.path(lang), serde_json::to_string_pretty(&record)?.as_bytes())?;
        tracing::info!("Updated {} preset with dev F1 {:.2}", lang, score);
        Ok(true)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
