//! Trainer wrapping the sequence model: optimisation, decoding and
//! checkpointing.
//!
//! Checkpoints are safetensors files. Alongside the parameters they carry
//! the character vocabulary and the shape options in the header metadata,
//! so a checkpoint can be validated before any parameter is touched.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD, VarBuilder, VarMap};
use safetensors::SafeTensors;
use wakachi_core::persist::{commit, ensure_parent, temp_sibling};
use wakachi_core::{MwtConfig, OptimConfig, OptimizerKind, Strategy, Vocab, WakachiError};

use crate::data::Batch;
use crate::expander::Expander;
use crate::model::{Padded, Seq2SeqModel};

const META_VOCAB: &str = "vocab";
const META_VOCAB_SIZE: &str = "vocab_size";

enum Optim {
    Sgd(SGD),
    AdamW(AdamW),
}

impl Optim {
    fn new(cfg: &OptimConfig, vars: Vec<Var>) -> candle_core::Result<Self> {
        Ok(match cfg.optim {
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vars, cfg.lr)?),
            OptimizerKind::Adam | OptimizerKind::Adamw => {
                let params = ParamsAdamW {
                    lr: cfg.lr,
                    weight_decay: if cfg.optim == OptimizerKind::Adam { 0.0 } else { 0.01 },
                    ..ParamsAdamW::default()
                };
                Self::AdamW(AdamW::new(vars, params)?)
            }
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        match self {
            Self::Sgd(o) => o.step(grads),
            Self::AdamW(o) => o.step(grads),
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Sgd(o) => o.set_learning_rate(lr),
            Self::AdamW(o) => o.set_learning_rate(lr),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd(o) => o.learning_rate(),
            Self::AdamW(o) => o.learning_rate(),
        }
    }
}

pub struct Seq2SeqTrainer {
    config: MwtConfig,
    vocab: Vocab,
    device: Device,
    varmap: VarMap,
    model: Seq2SeqModel,
    optimizer: Optim,
}

impl Seq2SeqTrainer {
    /// Build a freshly initialised model sized by `vocab`.
    ///
    /// Fails with [`WakachiError::VocabMismatch`] when `config` records a
    /// different vocabulary size.
    pub fn new(config: MwtConfig, vocab: Vocab) -> Result<Self> {
        config.ensure_vocab_compatible(vocab.len())?;
        let device = if config.cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Seq2SeqModel::new(config.model(), vocab.len(), vb)?;
        let optimizer = Optim::new(config.optim(), varmap.all_vars())?;
        tracing::debug!(
            vocab = vocab.len(),
            params = varmap.all_vars().len(),
            device = ?device,
            "Built sequence model"
        );
        Ok(Self {
            config,
            vocab,
            device,
            varmap,
            model,
            optimizer,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        let m = self.config.model();
        Ok(HashMap::from([
            (META_VOCAB.to_string(), self.vocab.to_json()?),
            (META_VOCAB_SIZE.to_string(), self.vocab.len().to_string()),
            ("hidden_dim".to_string(), m.hidden_dim.to_string()),
            ("emb_dim".to_string(), m.emb_dim.to_string()),
            ("num_layers".to_string(), m.num_layers.to_string()),
        ]))
    }
}

/// Read the vocabulary stored in a checkpoint's header.
pub fn read_vocab(path: &Path) -> Result<Vocab> {
    let bytes = fs::read(path).with_context(|| format!("reading checkpoint {}", path.display()))?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let meta = header
        .metadata()
        .as_ref()
        .ok_or_else(|| anyhow!("checkpoint {} has no metadata", path.display()))?;
    let json = meta
        .get(META_VOCAB)
        .ok_or_else(|| anyhow!("checkpoint {} has no vocabulary", path.display()))?;
    Ok(Vocab::from_json(json)?)
}

/// Scale gradients in place so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> candle_core::Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = g.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

impl Expander for Seq2SeqTrainer {
    fn strategy(&self) -> Strategy {
        Strategy::Sequence
    }

    fn is_iterative(&self) -> bool {
        true
    }

    fn update(&mut self, batch: &Batch) -> Result<f32> {
        let targets = batch
            .tgt_ids
            .as_ref()
            .context("sequence update needs a training batch with gold expansions")?;
        let padded = Padded::new(&batch.src_ids, targets, self.config.model().max_dec_len, &self.device)?;
        let loss = self.model.loss(&padded, true)?;
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&mut grads, &self.varmap.all_vars(), self.config.optim().max_grad_norm)?;
        self.optimizer.step(&grads)?;
        let loss = loss.to_scalar::<f32>()?;
        tracing::trace!(loss, grad_norm = norm, "Update step");
        Ok(loss)
    }

    fn predict(&self, batch: &Batch) -> Result<Vec<Vec<String>>> {
        let m = self.config.model();
        batch
            .src_ids
            .iter()
            .map(|src| {
                let ids = self.model.beam_search(src, m.beam_size, m.max_dec_len)?;
                Ok(self.vocab.decode_expansion(&ids))
            })
            .collect()
    }

    fn change_lr(&mut self, lr: f64) -> Result<()> {
        self.optimizer.set_learning_rate(lr);
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let tensors: Vec<(String, Tensor)> = {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("parameter store lock poisoned"))?;
            data.iter()
                .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_device(&Device::Cpu)?)))
                .collect::<candle_core::Result<_>>()?
        };

        ensure_parent(path)?;
        let tmp = temp_sibling(path);
        safetensors::serialize_to_file(
            tensors.iter().map(|(name, t)| (name.as_str(), t)),
            &Some(self.metadata()?),
            &tmp,
        )?;
        commit(&tmp, path)?;
        tracing::info!("Saved checkpoint with {} tensors to {}", tensors.len(), path.display());
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path).with_context(|| format!("reading checkpoint {}", path.display()))?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let meta = header
            .metadata()
            .as_ref()
            .ok_or_else(|| anyhow!("checkpoint {} has no metadata", path.display()))?;

        let stored: usize = meta
            .get(META_VOCAB_SIZE)
            .ok_or_else(|| anyhow!("checkpoint {} has no vocabulary size", path.display()))?
            .parse()
            .context("parsing checkpoint vocabulary size")?;
        if stored != self.vocab.len() {
            return Err(WakachiError::VocabMismatch {
                expected: stored,
                found: self.vocab.len(),
            }
            .into());
        }
        let vocab = match meta.get(META_VOCAB) {
            Some(json) => Vocab::from_json(json)?,
            None => self.vocab.clone(),
        };

        let tensors = candle_core::safetensors::load_buffer(&bytes, &self.device)?;
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter store lock poisoned"))?;

        // Check everything first so a bad file leaves the model untouched.
        for (name, var) in data.iter() {
            let t = tensors.get(name).ok_or_else(|| WakachiError::MissingParameter {
                path: path.to_path_buf(),
                name: name.clone(),
            })?;
            if t.dims() != var.dims() {
                return Err(WakachiError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    found: t.dims().to_vec(),
                }
                .into());
            }
        }
        for (name, var) in data.iter() {
            if let Some(t) = tensors.get(name) {
                var.set(&t.to_dtype(DType::F32)?)?;
            }
        }
        drop(data);

        self.vocab = vocab;
        tracing::info!("Loaded checkpoint from {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wakachi_core::Document;

    const TRAIN: &str = "\
1-2\tdu\t_\t_\t_\t_\t_\t_\t_\t_
1\tde\t_\t_\t_\t_\t_\t_\t_\t_
2\tle\t_\t_\t_\t_\t_\t_\t_\t_

1-2\tau\t_\t_\t_\t_\t_\t_\t_\t_
1\tà\t_\t_\t_\t_\t_\t_\t_\t_
2\tle\t_\t_\t_\t_\t_\t_\t_\t_
";

    fn setup(optim: OptimizerKind) -> (MwtConfig, Vocab, Batch) {
        let pairs = Document::parse(TRAIN).unwrap().expansions();
        let vocab = Vocab::build(pairs.iter().map(|(s, w)| (s.as_str(), w.as_slice())));
        let mut cfg = MwtConfig::new("fr");
        cfg.cpu = true;
        cfg.hyper.optim.optim = optim;
        cfg.hyper.optim.lr = 0.05;
        cfg.hyper.model.hidden_dim = 16;
        cfg.hyper.model.emb_dim = 8;
        cfg.hyper.model.dropout = 0.0;
        cfg.hyper.model.emb_dropout = 0.0;
        cfg.hyper.model.max_dec_len = 8;
        cfg.vocab_size = Some(vocab.len());
        let batch = Batch::from_pairs(&pairs, vec![0, 1], &vocab);
        (cfg, vocab, batch)
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("wakachi-seq2seq-{}-{name}", std::process::id()))
    }

    #[test]
    fn loss_decreases_with_training() {
        let (cfg, vocab, batch) = setup(OptimizerKind::Adam);
        let mut trainer = Seq2SeqTrainer::new(cfg, vocab).unwrap();
        let first = trainer.update(&batch).unwrap();
        let mut last = first;
        for _ in 0..30 {
            last = trainer.update(&batch).unwrap();
        }
        assert!(last < first, "loss went from {first} to {last}");
    }

    fn eval_loss(trainer: &Seq2SeqTrainer, batch: &Batch) -> f32 {
        let targets = batch.tgt_ids.as_ref().unwrap();
        let padded = Padded::new(&batch.src_ids, targets, 8, &Device::Cpu).unwrap();
        trainer.model.loss(&padded, false).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn change_lr_keeps_adam_moments() {
        let (cfg, vocab, batch) = setup(OptimizerKind::Adamw);
        let init = temp_path("moments_init.safetensors");
        let after_one = temp_path("moments_step1.safetensors");

        let mut trainer = Seq2SeqTrainer::new(cfg.clone(), vocab.clone()).unwrap();
        trainer.save(&init).unwrap();
        let mut twin = Seq2SeqTrainer::new(cfg.clone(), vocab.clone()).unwrap();
        twin.load(&init).unwrap();

        trainer.update(&batch).unwrap();
        trainer.save(&after_one).unwrap();
        trainer.change_lr(0.01).unwrap();
        assert!((trainer.learning_rate() - 0.01).abs() < 1e-12);
        trainer.update(&batch).unwrap();

        twin.update(&batch).unwrap();
        twin.change_lr(0.01).unwrap();
        twin.update(&batch).unwrap();
        assert!((eval_loss(&trainer, &batch) - eval_loss(&twin, &batch)).abs() < 1e-6);

        // Same weights and lr but fresh moments must take a different step.
        let mut fresh = Seq2SeqTrainer::new(cfg.with_lr(0.01), vocab).unwrap();
        fresh.load(&after_one).unwrap();
        fresh.update(&batch).unwrap();
        assert!((eval_loss(&trainer, &batch) - eval_loss(&fresh, &batch)).abs() > 1e-6);

        fs::remove_file(&init).ok();
        fs::remove_file(&after_one).ok();
    }

    #[test]
    fn checkpoint_round_trip_reproduces_predictions() {
        let (cfg, vocab, batch) = setup(OptimizerKind::Adamw);
        let path = temp_path("fr_mwt_expander.safetensors");

        let mut trainer = Seq2SeqTrainer::new(cfg.clone(), vocab.clone()).unwrap();
        for _ in 0..5 {
            trainer.update(&batch).unwrap();
        }
        trainer.save(&path).unwrap();
        let before = trainer.predict(&batch).unwrap();

        assert_eq!(read_vocab(&path).unwrap(), vocab);

        let mut restored = Seq2SeqTrainer::new(cfg, vocab).unwrap();
        restored.load(&path).unwrap();
        assert_eq!(restored.predict(&batch).unwrap(), before);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn vocab_size_mismatch_fails_fast() {
        let (mut cfg, vocab, _) = setup(OptimizerKind::Adam);
        cfg.vocab_size = Some(vocab.len() + 3);
        let err = Seq2SeqTrainer::new(cfg, vocab).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<WakachiError>(),
            Some(WakachiError::VocabMismatch { .. })
        ));
    }

    #[test]
    fn loading_a_checkpoint_for_another_vocab_fails() {
        let (cfg, vocab, _) = setup(OptimizerKind::Adam);
        let path = temp_path("other_vocab.safetensors");
        Seq2SeqTrainer::new(cfg.clone(), vocab.clone()).unwrap().save(&path).unwrap();

        let mut bigger: Vec<String> = vocab.clone().into();
        bigger.push("z".into());
        let bigger = Vocab::from(bigger);
        let mut cfg = cfg;
        cfg.vocab_size = Some(bigger.len());
        let mut other = Seq2SeqTrainer::new(cfg, bigger).unwrap();
        let err = other.load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WakachiError>(),
            Some(WakachiError::VocabMismatch { .. })
        ));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let (cfg, vocab, _) = setup(OptimizerKind::Adam);
        let path = temp_path("wide.safetensors");
        Seq2SeqTrainer::new(cfg.clone(), vocab.clone()).unwrap().save(&path).unwrap();

        let mut narrow = cfg;
        narrow.hyper.model.hidden_dim = 12;
        let mut other = Seq2SeqTrainer::new(narrow, vocab).unwrap();
        let err = other.load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WakachiError>(),
            Some(WakachiError::ShapeMismatch { .. })
        ));
        fs::remove_file(&path).ok();
    }
}
