//! Dictionary-based MWT expander.
//!
//! Maps each surface form seen in training to the expansion it was most
//! often annotated with. When two expansions of a form are equally frequent
//! the one seen first wins. Unseen forms are returned unexpanded.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use wakachi_core::Strategy;
use wakachi_core::persist::write_atomic;

use crate::data::Batch;
use crate::expander::Expander;

#[derive(Debug, Clone, Default)]
pub struct DictTrainer {
    /// Per form: every observed expansion with its count, in first-seen order.
    counts: HashMap<String, Vec<(Vec<String>, usize)>>,
    table: HashMap<String, Vec<String>>,
}

impl DictTrainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every pair and resolve the table.
    pub fn train<'a, I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (&'a String, &'a Vec<String>)>,
    {
        for (form, expansion) in pairs {
            self.observe(form, expansion);
        }
    }

    /// Record one annotated occurrence of `form`.
    pub fn observe(&mut self, form: &str, expansion: &[String]) {
        let seen = self.counts.entry(form.to_string()).or_default();
        match seen.iter_mut().find(|(e, _)| e.as_slice() == expansion) {
            Some((_, n)) => *n += 1,
            None => seen.push((expansion.to_vec(), 1)),
        }

        // Strict `>` keeps the earliest expansion among equal counts.
        let mut best = &seen[0];
        for candidate in &seen[1..] {
            if candidate.1 > best.1 {
                best = candidate;
            }
        }
        self.table.insert(form.to_string(), best.0.clone());
    }

    /// Expansion of `form`, or `form` itself when it was never seen.
    pub fn expand(&self, form: &str) -> Vec<String> {
        self.table
            .get(form)
            .cloned()
            .unwrap_or_else(|| vec![form.to_string()])
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Expander for DictTrainer {
    fn strategy(&self) -> Strategy {
        Strategy::Dictionary
    }

    fn is_iterative(&self) -> bool {
        false
    }

    fn update(&mut self, batch: &Batch) -> Result<f32> {
        if batch.targets.is_none() {
            anyhow::bail!("dictionary update needs a training batch with gold expansions");
        }
        self.train(batch.pairs());
        Ok(0.0)
    }

    fn predict(&self, batch: &Batch) -> Result<Vec<Vec<String>>> {
        Ok(batch.sources.iter().map(|s| self.expand(s)).collect())
    }

    fn change_lr(&mut self, _lr: f64) -> Result<()> {
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let sorted: BTreeMap<&String, &Vec<String>> = self.table.iter().collect();
        let json = serde_json::to_string_pretty(&sorted)?;
        write_atomic(path, json.as_bytes())?;
        tracing::info!("Saved dictionary with {} entries to {}", self.table.len(), path.display());
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading dictionary {}", path.display()))?;
        self.table = serde_json::from_str(&json)
            .with_context(|| format!("parsing dictionary {}", path.display()))?;
        self.counts.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wakachi_core::Vocab;

    fn words(ws: &[&str]) -> Vec<String> {
        ws.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn majority_expansion_wins() {
        let mut dict = DictTrainer::new();
        dict.observe("don't", &words(&["do", "n't"]));
        dict.observe("don't", &words(&["do", "not"]));
        dict.observe("don't", &words(&["do", "n't"]));
        dict.observe("don't", &words(&["do", "n't"]));
        assert_eq!(dict.expand("don't"), words(&["do", "n't"]));
    }

    #[test]
    fn minority_first_does_not_stick() {
        let mut dict = DictTrainer::new();
        dict.observe("don't", &words(&["do", "not"]));
        for _ in 0..3 {
            dict.observe("don't", &words(&["do", "n't"]));
        }
        assert_eq!(dict.expand("don't"), words(&["do", "n't"]));
    }

    #[test]
    fn ties_go_to_first_seen() {
        let mut dict = DictTrainer::new();
        dict.observe("au", &words(&["à", "le"]));
        dict.observe("au", &words(&["a", "le"]));
        assert_eq!(dict.expand("au"), words(&["à", "le"]));

        // "a le" takes the lead, then "à le" catches up and wins the tie again
        dict.observe("au", &words(&["a", "le"]));
        assert_eq!(dict.expand("au"), words(&["a", "le"]));
        dict.observe("au", &words(&["à", "le"]));
        assert_eq!(dict.expand("au"), words(&["à", "le"]));
    }

    #[test]
    fn unseen_token_is_identity() {
        let dict = DictTrainer::new();
        assert_eq!(dict.expand("chat"), words(&["chat"]));
    }

    #[test]
    fn update_and_predict_through_batches() {
        let pairs = vec![
            ("don't".to_string(), words(&["do", "n't"])),
            ("can't".to_string(), words(&["ca", "n't"])),
        ];
        let vocab = Vocab::build(pairs.iter().map(|(s, w)| (s.as_str(), w.as_slice())));
        let mut dict = DictTrainer::new();
        dict.update(&Batch::from_pairs(&pairs, vec![0, 1], &vocab)).unwrap();

        let batch = Batch::from_sources(&["can't".to_string(), "won't".to_string()], vec![0, 1], &vocab);
        let preds = dict.predict(&batch).unwrap();
        assert_eq!(preds, vec![words(&["ca", "n't"]), words(&["won't"])]);

        let unlabeled = Batch::from_sources(&["x".to_string()], vec![0], &vocab);
        assert!(dict.update(&unlabeled).is_err());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("wakachi-dict-{}", std::process::id()));
        let path = dir.join("en_mwt_expander.json");

        let mut dict = DictTrainer::new();
        dict.observe("don't", &words(&["do", "n't"]));
        dict.observe("gonna", &words(&["gon", "na"]));
        dict.save(&path).unwrap();

        let mut restored = DictTrainer::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.expand("gonna"), words(&["gon", "na"]));
        fs::remove_dir_all(&dir).ok();
    }
}
