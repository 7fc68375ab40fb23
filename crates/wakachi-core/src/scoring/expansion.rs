//! # Expansion Scoring
//!
//! Compares a system CoNLL-U file with its gold reference. Tokens are
//! aligned by position, sentence by sentence. An expansion is any token
//! written as a multi-word range; a system expansion is correct only when the
//! gold token at the same position is expanded into exactly the same words.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::conllu::Document;
use crate::error::{Result, WakachiError};

/// Corpus-level expansion quality, each value a fraction in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Score {
    /// Reduce raw counts. Any zero denominator yields 0.0 for that value.
    #[must_use]
    pub fn from_counts(correct: usize, predicted: usize, gold: usize) -> Self {
        let precision = ratio(correct, predicted);
        let recall = ratio(correct, gold);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Score the system file at `system` against the gold file at `gold`.
pub fn score(system: &Path, gold: &Path) -> Result<Score> {
    let system = Document::read(system)?;
    let gold = Document::read(gold)?;
    score_documents(&system, &gold)
}

/// Score two already parsed documents.
pub fn score_documents(system: &Document, gold: &Document) -> Result<Score> {
    if system.sentences.len() != gold.sentences.len() {
        return Err(WakachiError::Alignment {
            sentence: system.sentences.len().min(gold.sentences.len()),
            reason: format!(
                "sentence count {} vs {}",
                system.sentences.len(),
                gold.sentences.len()
            ),
        });
    }

    let mut correct = 0usize;
    let mut predicted = 0usize;
    let mut expected = 0usize;

    for (idx, (sys, gld)) in system.sentences.iter().zip(&gold.sentences).enumerate() {
        if sys.tokens.len() != gld.tokens.len() {
            return Err(WakachiError::Alignment {
                sentence: idx,
                reason: format!("token count {} vs {}", sys.tokens.len(), gld.tokens.len()),
            });
        }

        for (s, g) in sys.tokens.iter().zip(&gld.tokens) {
            if s.is_multiword() {
                predicted += 1;
            }
            if g.is_multiword() {
                expected += 1;
            }
            if s.is_multiword() && g.is_multiword() && s.words == g.words {
                correct += 1;
            }
        }
    }

    tracing::debug!(correct, predicted, gold = expected, "Scored expansions");
    Ok(Score::from_counts(correct, predicted, expected))
}
