//! Batching over a CoNLL-U candidate source.

use std::path::Path;

use anyhow::{Context, Result};
use oorandom::Rand64;
use wakachi_core::{Document, MwtConfig, Vocab};

/// A group of examples handed to a trainer in one call.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Surface forms to expand.
    pub sources: Vec<String>,
    /// Gold expansions, present on training batches only.
    pub targets: Option<Vec<Vec<String>>>,
    /// Character ids of `sources`.
    pub src_ids: Vec<Vec<u32>>,
    /// Character ids of the space-joined `targets`.
    pub tgt_ids: Option<Vec<Vec<u32>>>,
    /// Index of each example in the provider's example order, used to put
    /// predictions back in document order.
    pub positions: Vec<usize>,
}

impl Batch {
    /// Training batch from (form, expansion) pairs.
    pub fn from_pairs(pairs: &[(String, Vec<String>)], positions: Vec<usize>, vocab: &Vocab) -> Self {
        Self {
            sources: pairs.iter().map(|(s, _)| s.clone()).collect(),
            src_ids: pairs.iter().map(|(s, _)| vocab.encode(s)).collect(),
            tgt_ids: Some(pairs.iter().map(|(_, w)| vocab.encode_expansion(w)).collect()),
            targets: Some(pairs.iter().map(|(_, w)| w.clone()).collect()),
            positions,
        }
    }

    /// Prediction batch from surface forms.
    pub fn from_sources(sources: &[String], positions: Vec<usize>, vocab: &Vocab) -> Self {
        Self {
            sources: sources.to_vec(),
            src_ids: sources.iter().map(|s| vocab.encode(s)).collect(),
            targets: None,
            tgt_ids: None,
            positions,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// (source, gold expansion) pairs of a training batch.
    pub fn pairs(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.sources
            .iter()
            .zip(self.targets.iter().flatten())
    }
}

/// Splits a CoNLL-U file into fixed-size batches.
///
/// Training providers iterate a shuffled, optionally subsampled set of
/// multi-word token pairs; evaluation providers iterate every candidate in
/// document order.
pub struct BatchProvider {
    document: Document,
    vocab: Vocab,
    /// Every training pair in document order, before shuffling or sampling.
    pairs: Vec<(String, Vec<String>)>,
    batches: Vec<Batch>,
    num_examples: usize,
}

impl BatchProvider {
    /// Load `path` and batch it.
    ///
    /// A missing file yields an empty provider: callers treat zero batches
    /// as "nothing to do" rather than as an error.
    pub fn new(
        path: &Path,
        batch_size: usize,
        config: &MwtConfig,
        vocab: Option<Vocab>,
        evaluation: bool,
    ) -> Result<Self> {
        let document = if path.exists() {
            Document::read(path).with_context(|| format!("reading {}", path.display()))?
        } else {
            tracing::warn!("Data file {} not found; treating it as empty", path.display());
            Document::default()
        };
        Ok(Self::from_document(document, batch_size, config, vocab, evaluation))
    }

    /// Batch an already parsed document.
    pub fn from_document(
        document: Document,
        batch_size: usize,
        config: &MwtConfig,
        vocab: Option<Vocab>,
        evaluation: bool,
    ) -> Self {
        let batch_size = batch_size.max(1);

        let (vocab, pairs, batches, num_examples) = if evaluation {
            let sources: Vec<String> = document.candidates().into_iter().map(|c| c.form).collect();
            let vocab = vocab.unwrap_or_else(|| {
                Vocab::build(sources.iter().map(|s| (s.as_str(), &[] as &[String])))
            });
            let batches: Vec<Batch> = sources
                .chunks(batch_size)
                .enumerate()
                .map(|(i, chunk)| {
                    let start = i * batch_size;
                    Batch::from_sources(chunk, (start..start + chunk.len()).collect(), &vocab)
                })
                .collect();
            (vocab, Vec::new(), batches, sources.len())
        } else {
            let pairs = document.expansions();
            let vocab = vocab.unwrap_or_else(|| {
                Vocab::build(pairs.iter().map(|(s, w)| (s.as_str(), w.as_slice())))
            });
            let order = subsample(pairs.len(), config.optim().sample_train, config.seed);
            let batches: Vec<Batch> = order
                .chunks(batch_size)
                .map(|idx| {
                    let chunk: Vec<_> = idx.iter().map(|&i| pairs[i].clone()).collect();
                    Batch::from_pairs(&chunk, idx.to_vec(), &vocab)
                })
                .collect();
            let num_examples = order.len();
            (vocab, pairs, batches, num_examples)
        };

        tracing::debug!(
            examples = num_examples,
            batches = batches.len(),
            evaluation,
            "Built batch provider"
        );

        Self {
            document,
            vocab,
            pairs,
            batches,
            num_examples,
        }
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of examples across all batches.
    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }

    /// All (form, expansion) pairs of a training provider in document
    /// order, ignoring `sample_train`. Empty for evaluation providers.
    pub fn pairs(&self) -> &[(String, Vec<String>)] {
        &self.pairs
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }
}

impl<'a> IntoIterator for &'a BatchProvider {
    type Item = &'a Batch;
    type IntoIter = std::slice::Iter<'a, Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Shuffle `0..n` with a seeded generator and keep the first
/// `floor(n * fraction)` indices, at least one.
fn subsample(n: usize, fraction: f64, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = Rand64::new(seed as u128);
    for i in (1..indices.len()).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        indices.swap(i, j);
    }
    if n > 0 && fraction < 1.0 {
        let keep = ((n as f64) * fraction).floor().max(1.0) as usize;
        indices.truncate(keep.min(n));
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRAIN: &str = "\
1-2\tdu\t_\t_\t_\t_\t_\t_\t_\t_
1\tde\t_\t_\t_\t_\t_\t_\t_\t_
2\tle\t_\t_\t_\t_\t_\t_\t_\t_
3\tpain\t_\t_\t_\t_\t_\t_\t_\t_

1-2\tau\t_\t_\t_\t_\t_\t_\t_\t_
1\tà\t_\t_\t_\t_\t_\t_\t_\t_
2\tle\t_\t_\t_\t_\t_\t_\t_\t_
3-4\tdes\t_\t_\t_\t_\t_\t_\t_\t_
3\tde\t_\t_\t_\t_\t_\t_\t_\t_
4\tles\t_\t_\t_\t_\t_\t_\t_\t_
5\tenfants\t_\t_\t_\t_\t_\t_\t_\t_
";

    fn provider(evaluation: bool, batch_size: usize, config: &MwtConfig) -> BatchProvider {
        let doc = Document::parse(TRAIN).unwrap();
        BatchProvider::from_document(doc, batch_size, config, None, evaluation)
    }

    #[test]
    fn training_batches_cover_all_pairs() {
        let cfg = MwtConfig::new("fr");
        let p = provider(false, 2, &cfg);
        assert_eq!(p.num_examples(), 3);
        assert_eq!(p.len(), 2);

        let mut forms: Vec<&String> = p.iter().flat_map(|b| b.sources.iter()).collect();
        forms.sort();
        assert_eq!(forms, ["au", "des", "du"]);

        for batch in &p {
            assert!(batch.targets.is_some());
            assert_eq!(batch.src_ids.len(), batch.len());
        }
    }

    #[test]
    fn pairs_keep_document_order() {
        let cfg = MwtConfig::new("fr");
        let p = provider(false, 1, &cfg);
        let forms: Vec<&str> = p.pairs().iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(forms, ["du", "au", "des"]);
    }

    #[test]
    fn shuffle_is_seeded() {
        let cfg = MwtConfig::new("fr");
        let a: Vec<_> = provider(false, 1, &cfg).iter().map(|b| b.sources.clone()).collect();
        let b: Vec<_> = provider(false, 1, &cfg).iter().map(|b| b.sources.clone()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn subsampling_keeps_fraction() {
        let mut cfg = MwtConfig::new("fr");
        cfg.hyper.optim.sample_train = 0.5;
        let p = provider(false, 10, &cfg);
        assert_eq!(p.num_examples(), 1);
        assert_eq!(p.pairs().len(), 3);
        assert_eq!(subsample(10, 0.25, 7).len(), 2);
        assert_eq!(subsample(3, 0.1, 7).len(), 1);
        assert_eq!(subsample(0, 0.5, 7).len(), 0);
    }

    #[test]
    fn evaluation_batches_keep_document_order() {
        let cfg = MwtConfig::new("fr");
        let p = provider(true, 2, &cfg);
        let forms: Vec<&String> = p.iter().flat_map(|b| b.sources.iter()).collect();
        assert_eq!(forms, ["du", "au", "des"]);
        let positions: Vec<usize> = p.iter().flat_map(|b| b.positions.iter().copied()).collect();
        assert_eq!(positions, [0, 1, 2]);
        assert!(p.iter().all(|b| b.targets.is_none()));
        assert!(p.pairs().is_empty());
    }

    #[test]
    fn missing_file_is_empty_not_error() {
        let cfg = MwtConfig::new("fr");
        let p = BatchProvider::new(Path::new("/nonexistent/wakachi/train.conllu"), 50, &cfg, None, false)
            .unwrap();
        assert!(p.is_empty());
        assert_eq!(p.len(), 0);
        assert_eq!(p.num_examples(), 0);
    }
}
