//! Training and evaluation control flow.
//!
//! Training runs the epoch loop for iterative expanders and a single fit
//! for the dictionary. Each epoch ends with a full dev pass: predictions
//! are written to the output file and scored against the gold file, and
//! that score drives checkpoint selection and learning-rate decay.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use wakachi_core::{MwtConfig, Score, Strategy, score};

use crate::data::{Batch, BatchProvider};
use crate::expander::{Expander, build_expander};
use crate::preset::PresetStore;
use crate::seq2seq::read_vocab;
use crate::state::TrainingState;

/// Files a run reads and writes.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub train_file: PathBuf,
    pub eval_file: PathBuf,
    /// Where dev/eval predictions are serialized before scoring.
    pub output_file: PathBuf,
    pub gold_file: PathBuf,
    pub save_dir: PathBuf,
    /// Checkpoint file name inside `save_dir`, overriding the default.
    pub save_name: Option<String>,
    /// Preset store directory. Presets are neither read nor written when unset.
    pub preset_dir: Option<PathBuf>,
}

impl RunPaths {
    pub fn config_file(&self, lang: &str) -> PathBuf {
        self.save_dir.join(format!("{lang}_config.json"))
    }

    pub fn model_file(&self, config: &MwtConfig) -> PathBuf {
        match &self.save_name {
            Some(name) => self.save_dir.join(name),
            None => {
                let ext = match config.strategy {
                    Strategy::Dictionary => "json",
                    Strategy::Sequence => "safetensors",
                };
                self.save_dir.join(format!("{}_mwt_expander.{ext}", config.lang))
            }
        }
    }
}

/// Result of a completed training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    /// Dev F1 per epoch, as fractions.
    pub history: Vec<f64>,
    pub best_score: f64,
    /// 1-based epoch that first reached `best_score`.
    pub best_epoch: usize,
    pub final_lr: f64,
    pub model_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// Training or dev data was empty; nothing was trained or saved.
    Skipped,
    Trained(TrainReport),
}

/// Result of an evaluation-only run. `score` is absent when there was no
/// evaluation data.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub lang: String,
    pub score: Option<Score>,
}

pub struct Orchestrator {
    paths: RunPaths,
}

impl Orchestrator {
    pub fn new(paths: RunPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    fn presets(&self) -> Option<PresetStore> {
        self.paths.preset_dir.as_ref().map(PresetStore::new)
    }

    /// Train an expander for `config.lang`.
    ///
    /// With `best_param` the stored preset replaces the configured
    /// hyperparameters before any data is loaded.
    pub fn train(&self, mut config: MwtConfig, best_param: bool) -> Result<TrainOutcome> {
        if best_param {
            match self.presets() {
                Some(store) => {
                    store.apply(&mut config)?;
                }
                None => tracing::warn!("Preset requested but no preset directory is configured"),
            }
        }
        config.validate()?;

        let batch_size = config.optim().batch_size;
        tracing::info!(
            "Loading data from {} with batch size {}...",
            self.paths.train_file.display(),
            batch_size
        );
        let train = BatchProvider::new(&self.paths.train_file, batch_size, &config, None, false)?;
        let vocab = train.vocab().clone();
        config.vocab_size = Some(vocab.len());
        let dev = BatchProvider::new(&self.paths.eval_file, batch_size, &config, Some(vocab.clone()), true)?;

        let model_file = self.paths.model_file(&config);
        config.model_file = Some(model_file);
        let config_file = self.paths.config_file(&config.lang);
        config
            .save(&config_file)
            .with_context(|| format!("saving config to {}", config_file.display()))?;

        if train.is_empty() || dev.is_empty() {
            tracing::info!(
                train_batches = train.len(),
                dev_batches = dev.len(),
                "Skip training because no data available"
            );
            return Ok(TrainOutcome::Skipped);
        }

        let mut trainer = build_expander(&config, &vocab)?;
        tracing::info!(
            "Training {} MWT expander on {} examples...",
            config.strategy,
            train.num_examples()
        );
        self.run(&config, trainer.as_mut(), &train, &dev)
            .map(TrainOutcome::Trained)
    }

    /// Drive `trainer` over `train`, selecting checkpoints on `dev`.
    pub fn run(
        &self,
        config: &MwtConfig,
        trainer: &mut dyn Expander,
        train: &BatchProvider,
        dev: &BatchProvider,
    ) -> Result<TrainReport> {
        let model_file = config
            .model_file
            .clone()
            .unwrap_or_else(|| self.paths.model_file(config));

        if !trainer.is_iterative() {
            // One pass over every pair in corpus order: no shuffling, no sampling.
            let pairs = train.pairs();
            let all = Batch::from_pairs(pairs, (0..pairs.len()).collect(), train.vocab());
            trainer.update(&all)?;
            tracing::info!("Evaluating on dev set...");
            let dev_score = self.score_dev(trainer, dev)?.f1;
            tracing::info!("Dev F1 = {:.2}", dev_score * 100.0);
            trainer
                .save(&model_file)
                .with_context(|| format!("saving model to {}", model_file.display()))?;
            return Ok(TrainReport {
                history: vec![dev_score],
                best_score: dev_score,
                best_epoch: 1,
                final_lr: config.optim().lr,
                model_file,
            });
        }

        let o = config.optim();
        let mut state = TrainingState::new(o.lr);
        let max_steps = train.len() * o.num_epoch;

        for epoch in 1..=o.num_epoch {
            let mut train_loss = 0f64;
            for batch in train {
                let start = Instant::now();
                state.global_step += 1;
                let loss = trainer
                    .update(batch)
                    .with_context(|| format!("update at step {} of epoch {epoch}", state.global_step))?;
                train_loss += f64::from(loss);
                if state.global_step % o.log_step == 0 {
                    tracing::info!(
                        "step {}/{} (epoch {}/{}), loss = {:.6} ({:.3} sec/batch), lr: {:.6}",
                        state.global_step,
                        max_steps,
                        epoch,
                        o.num_epoch,
                        loss,
                        start.elapsed().as_secs_f64(),
                        state.current_lr
                    );
                }
            }

            tracing::info!("Evaluating on dev set...");
            let dev_score = self
                .score_dev(trainer, dev)
                .with_context(|| format!("evaluating epoch {epoch}"))?
                .f1;
            tracing::info!(
                "epoch {}: train_loss = {:.6}, dev_score = {:.4}",
                epoch,
                train_loss / train.len() as f64,
                dev_score
            );

            if state.is_new_best(dev_score) {
                trainer
                    .save(&model_file)
                    .with_context(|| format!("saving epoch {epoch} model to {}", model_file.display()))?;
                tracing::info!("New best model saved");
            }

            if state.should_decay(epoch, o.decay_epoch, dev_score) {
                let lr = state.decay(o.lr_decay);
                trainer.change_lr(lr)?;
                tracing::info!("Decayed learning rate to {:.6}", lr);
            }

            state.record(dev_score);
        }

        tracing::info!("Training ended with {} epochs", o.num_epoch);
        let (best_score, best_epoch) = state.best().unwrap_or((0.0, 0));
        tracing::info!("Best dev F1 = {:.2}, at epoch = {}", best_score * 100.0, best_epoch);

        if let Some(store) = self.presets() {
            store.update(&config.lang, &config.hyper, best_score * 100.0)?;
        }

        Ok(TrainReport {
            history: state.history().to_vec(),
            best_score,
            best_epoch,
            final_lr: state.current_lr,
            model_file,
        })
    }

    /// Predict every dev candidate, write the output file and score it.
    fn score_dev(&self, trainer: &dyn Expander, dev: &BatchProvider) -> Result<Score> {
        let mut predictions = Vec::with_capacity(dev.num_examples());
        for batch in dev {
            predictions.extend(trainer.predict(batch)?);
        }
        let system = dev.document().with_expansions(&predictions)?;
        system
            .write(&self.paths.output_file)
            .with_context(|| format!("writing predictions to {}", self.paths.output_file.display()))?;
        score(&self.paths.output_file, &self.paths.gold_file).with_context(|| {
            format!(
                "scoring {} against {}",
                self.paths.output_file.display(),
                self.paths.gold_file.display()
            )
        })
    }

    /// Evaluate the stored model for `lang` on the eval file.
    pub fn evaluate(&self, lang: &str) -> Result<EvalReport> {
        let config_file = self.paths.config_file(lang);
        let config = MwtConfig::load(&config_file)
            .with_context(|| format!("loading config {}", config_file.display()))?;
        let batch_size = config.optim().batch_size;

        let data = BatchProvider::new(&self.paths.eval_file, batch_size, &config, None, true)?;
        if data.is_empty() {
            tracing::info!("Skip evaluation because no dev data is available");
            return Ok(EvalReport {
                lang: lang.to_string(),
                score: None,
            });
        }

        let model_file = config
            .model_file
            .clone()
            .unwrap_or_else(|| self.paths.model_file(&config));

        // The sequence model only understands the ids it was trained with.
        let data = match config.strategy {
            Strategy::Sequence => {
                let vocab = read_vocab(&model_file)?;
                config.ensure_vocab_compatible(vocab.len())?;
                BatchProvider::from_document(data.into_document(), batch_size, &config, Some(vocab), true)
            }
            Strategy::Dictionary => data,
        };

        let mut trainer = build_expander(&config, data.vocab())?;
        trainer
            .load(&model_file)
            .with_context(|| format!("loading model {}", model_file.display()))?;

        tracing::info!("Start evaluation...");
        let score = self.score_dev(trainer.as_ref(), &data)?;
        tracing::info!("MWT expansion score: {} {:.2}", lang, score.f1 * 100.0);
        Ok(EvalReport {
            lang: lang.to_string(),
            score: Some(score),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;

    use super::*;
    use wakachi_core::{Document, WakachiError};

    const TRAIN: &str = "\
1-2\tdu\t_\t_\t_\t_\t_\t_\t_\t_
1\tde\t_\t_\t_\t_\t_\t_\t_\t_
2\tle\t_\t_\t_\t_\t_\t_\t_\t_
3\tpain\t_\t_\t_\t_\t_\t_\t_\t_

1-2\tau\t_\t_\t_\t_\t_\t_\t_\t_
1\tà\t_\t_\t_\t_\t_\t_\t_\t_
2\tle\t_\t_\t_\t_\t_\t_\t_\t_
3\tmarché\t_\t_\t_\t_\t_\t_\t_\t_
";

    /// Eight sentences with one multi-word token each.
    fn dev_text() -> String {
        let mut text = String::new();
        for c in ['b', 'c', 'f', 'g', 'k', 'm', 'p', 't'] {
            text.push_str(&format!("1-2\t{c}u\t_\t_\t_\t_\t_\t_\t_\t_\n"));
            text.push_str(&format!("1\t{c}e\t_\t_\t_\t_\t_\t_\t_\t_\n"));
            text.push_str("2\tle\t_\t_\t_\t_\t_\t_\t_\t_\n\n");
        }
        text
    }

    fn workspace(name: &str) -> RunPaths {
        let dir = std::env::temp_dir().join(format!("wakachi-orch-{}-{name}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).unwrap();
        RunPaths {
            train_file: dir.join("train.conllu"),
            eval_file: dir.join("dev.conllu"),
            output_file: dir.join("dev.pred.conllu"),
            gold_file: dir.join("dev.conllu"),
            save_dir: dir.join("saved"),
            save_name: None,
            preset_dir: None,
        }
    }

    fn cleanup(paths: &RunPaths) {
        if let Some(dir) = paths.train_file.parent() {
            fs::remove_dir_all(dir).ok();
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Save(usize),
        ChangeLr(usize, f64),
    }

    /// Gets the first `script[epoch - 1]` dev candidates right and leaves
    /// the rest unexpanded, so dev F1 rises with the scripted count.
    struct ScriptedExpander {
        script: Vec<usize>,
        gold: Vec<Vec<String>>,
        epoch: usize,
        log: Rc<RefCell<Vec<Event>>>,
    }

    impl Expander for ScriptedExpander {
        fn strategy(&self) -> Strategy {
            Strategy::Sequence
        }

        fn is_iterative(&self) -> bool {
            true
        }

        fn update(&mut self, _batch: &Batch) -> Result<f32> {
            self.epoch += 1;
            Ok(1.0 / self.epoch as f32)
        }

        fn predict(&self, batch: &Batch) -> Result<Vec<Vec<String>>> {
            let correct = self.script[self.epoch - 1];
            Ok(batch
                .positions
                .iter()
                .zip(&batch.sources)
                .map(|(&pos, src)| {
                    if pos < correct {
                        self.gold[pos].clone()
                    } else {
                        vec![src.clone()]
                    }
                })
                .collect())
        }

        fn change_lr(&mut self, lr: f64) -> Result<()> {
            self.log.borrow_mut().push(Event::ChangeLr(self.epoch, lr));
            Ok(())
        }

        fn save(&self, _path: &Path) -> Result<()> {
            self.log.borrow_mut().push(Event::Save(self.epoch));
            Ok(())
        }

        fn load(&mut self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn scripted_run(
        name: &str,
        script: &[usize],
        decay_epoch: usize,
        preset_dir: Option<PathBuf>,
    ) -> (TrainReport, Vec<Event>) {
        let mut paths = workspace(name);
        paths.preset_dir = preset_dir;
        fs::write(&paths.gold_file, dev_text()).unwrap();

        let mut config = MwtConfig::new("fr").with_epochs(script.len()).with_lr(1.0);
        config.hyper.optim.decay_epoch = decay_epoch;
        config.hyper.optim.lr_decay = 0.5;

        let train = BatchProvider::from_document(Document::parse(TRAIN).unwrap(), 100, &config, None, false);
        let dev_doc = Document::parse(&dev_text()).unwrap();
        let gold = dev_doc.expansions().into_iter().map(|(_, w)| w).collect();
        let dev = BatchProvider::from_document(dev_doc, 3, &config, Some(train.vocab().clone()), true);

        let log = Rc::new(RefCell::new(Vec::new()));
        let mut trainer = ScriptedExpander {
            script: script.to_vec(),
            gold,
            epoch: 0,
            log: Rc::clone(&log),
        };
        let report = Orchestrator::new(paths.clone())
            .run(&config, &mut trainer, &train, &dev)
            .unwrap();
        cleanup(&paths);
        let events = log.borrow().clone();
        (report, events)
    }

    fn f1(correct: usize) -> f64 {
        Score::from_counts(correct, correct, 8).f1
    }

    #[test]
    fn checkpoint_and_decay_follow_their_own_baselines() {
        let (report, events) = scripted_run("policy", &[2, 5, 5, 3, 7], 2, None);
        assert_eq!(
            events,
            vec![
                Event::Save(1),
                Event::Save(2),
                Event::ChangeLr(3, 0.5),
                Event::ChangeLr(4, 0.25),
                Event::Save(5),
            ]
        );
        assert_eq!(report.history.len(), 5);
        assert!((report.history[1] - f1(5)).abs() < 1e-12);
        assert_eq!(report.best_epoch, 5);
        assert!((report.final_lr - 0.25).abs() < 1e-12);
    }

    #[test]
    fn recovery_below_best_neither_saves_nor_decays() {
        // epoch 3 beats epoch 2 but not epoch 1
        let (report, events) = scripted_run("recovery", &[5, 2, 3], 0, None);
        assert_eq!(events, vec![Event::Save(1), Event::ChangeLr(2, 0.5)]);
        assert_eq!(report.best_epoch, 1);
        assert!((report.best_score - f1(5)).abs() < 1e-12);
    }

    #[test]
    fn ties_keep_first_checkpoint_and_report_first_epoch() {
        let (report, events) = scripted_run("ties", &[4, 4, 4], 10, None);
        assert_eq!(events, vec![Event::Save(1)]);
        assert_eq!(report.best_epoch, 1);
    }

    #[test]
    fn best_score_reaches_preset_store() {
        let preset_dir = std::env::temp_dir().join(format!("wakachi-orch-presets-{}", std::process::id()));
        fs::remove_dir_all(&preset_dir).ok();
        let (report, _) = scripted_run("presets", &[1, 8], 10, Some(preset_dir.clone()));
        let record = PresetStore::new(&preset_dir).get("fr").unwrap().unwrap();
        assert!((record.score - report.best_score * 100.0).abs() < 1e-9);
        assert!((record.score - 100.0).abs() < 1e-9);
        fs::remove_dir_all(&preset_dir).ok();
    }

    #[test]
    fn empty_training_data_skips_without_checkpoint() {
        let paths = workspace("skip");
        fs::write(&paths.eval_file, dev_text()).unwrap();
        let orch = Orchestrator::new(paths.clone());
        let config = MwtConfig::new("fr").with_strategy(Strategy::Dictionary);

        let outcome = orch.train(config.clone(), false).unwrap();
        assert_eq!(outcome, TrainOutcome::Skipped);
        assert!(!paths.model_file(&config).exists());
        cleanup(&paths);
    }

    #[test]
    fn training_data_without_multiword_tokens_skips() {
        let paths = workspace("no-mwt");
        fs::write(&paths.train_file, "1\tle\t_\t_\t_\t_\t_\t_\t_\t_\n\n").unwrap();
        fs::write(&paths.eval_file, dev_text()).unwrap();
        let outcome = Orchestrator::new(paths.clone())
            .train(MwtConfig::new("fr"), false)
            .unwrap();
        assert_eq!(outcome, TrainOutcome::Skipped);
        cleanup(&paths);
    }

    #[test]
    fn dictionary_train_then_evaluate() {
        let paths = workspace("dict");
        fs::write(&paths.train_file, TRAIN).unwrap();
        fs::write(&paths.eval_file, TRAIN).unwrap();
        let orch = Orchestrator::new(paths.clone());
        let config = MwtConfig::new("fr").with_strategy(Strategy::Dictionary);

        let TrainOutcome::Trained(report) = orch.train(config, false).unwrap() else {
            panic!("dictionary training was skipped");
        };
        assert_eq!(report.history, vec![1.0]);
        assert!(report.model_file.exists());
        assert!(paths.config_file("fr").exists());

        let eval = orch.evaluate("fr").unwrap();
        assert_eq!(eval.score.map(|s| s.f1), Some(1.0));
        cleanup(&paths);
    }

    #[test]
    fn dictionary_sees_every_pair_in_file_order() {
        let paths = workspace("dict-order");
        let tie = "\
1-2\tau\t_\t_\t_\t_\t_\t_\t_\t_
1\tà\t_\t_\t_\t_\t_\t_\t_\t_
2\tle\t_\t_\t_\t_\t_\t_\t_\t_

";
        let rival = tie.replace("1\tà", "1\ta");
        fs::write(&paths.train_file, format!("{tie}{rival}{}", dev_text())).unwrap();
        fs::write(&paths.eval_file, format!("{tie}{}", dev_text())).unwrap();
        let orch = Orchestrator::new(paths.clone());

        for seed in 0..20 {
            let mut config = MwtConfig::new("fr")
                .with_strategy(Strategy::Dictionary)
                .with_batch_size(1)
                .with_seed(seed);
            config.hyper.optim.sample_train = 0.5;
            let TrainOutcome::Trained(report) = orch.train(config, false).unwrap() else {
                panic!("dictionary training was skipped");
            };
            assert_eq!(report.history, vec![1.0], "seed {seed}");
        }
        cleanup(&paths);
    }

    #[test]
    fn evaluation_without_data_reports_no_score() {
        let paths = workspace("eval-empty");
        MwtConfig::new("fr").save(&paths.config_file("fr")).unwrap();
        let eval = Orchestrator::new(paths.clone()).evaluate("fr").unwrap();
        assert_eq!(eval.score, None);
        cleanup(&paths);
    }

    fn tiny_sequence_config() -> MwtConfig {
        let mut config = MwtConfig::new("fr").with_epochs(2).with_batch_size(2);
        config.cpu = true;
        config.hyper.model.hidden_dim = 8;
        config.hyper.model.emb_dim = 4;
        config.hyper.model.max_dec_len = 6;
        config
    }

    #[test]
    fn sequence_train_then_evaluate() {
        let paths = workspace("seq");
        fs::write(&paths.train_file, TRAIN).unwrap();
        fs::write(&paths.eval_file, TRAIN).unwrap();
        let orch = Orchestrator::new(paths.clone());

        let TrainOutcome::Trained(report) = orch.train(tiny_sequence_config(), false).unwrap() else {
            panic!("sequence training was skipped");
        };
        assert_eq!(report.history.len(), 2);
        assert!(report.model_file.exists());
        assert!(paths.output_file.exists());

        let score = orch.evaluate("fr").unwrap().score.unwrap();
        assert!((0.0..=1.0).contains(&score.f1));
        cleanup(&paths);
    }

    #[test]
    fn evaluation_rejects_vocab_mismatch() {
        let paths = workspace("mismatch");
        fs::write(&paths.train_file, TRAIN).unwrap();
        fs::write(&paths.eval_file, TRAIN).unwrap();
        let orch = Orchestrator::new(paths.clone());
        orch.train(tiny_sequence_config().with_epochs(1), false).unwrap();

        let config_file = paths.config_file("fr");
        let mut config = MwtConfig::load(&config_file).unwrap();
        config.vocab_size = config.vocab_size.map(|n| n + 1);
        config.save(&config_file).unwrap();

        let err = orch.evaluate("fr").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WakachiError>(),
            Some(WakachiError::VocabMismatch { .. })
        ));
        cleanup(&paths);
    }
}
