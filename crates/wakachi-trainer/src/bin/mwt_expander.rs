//! MWT expander trainer and evaluator.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use wakachi_core::{
    AttentionType, Enc2Dec, Hyperparameters, ModelConfig, MwtConfig, OptimConfig, OptimizerKind,
    Strategy,
};
use wakachi_trainer::{Orchestrator, RunPaths, TrainOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Train,
    Predict,
}

#[derive(Parser)]
#[command(name = "mwt-expander")]
#[command(about = "Train and evaluate multi-word token expanders")]
#[command(version)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Train)]
    mode: Mode,

    /// Language code; names the config, checkpoint and preset files
    #[arg(long)]
    lang: String,

    /// Train with the stored best-known hyperparameters for the language
    #[arg(long)]
    best_param: bool,

    /// Only train a dictionary-based expander
    #[arg(long)]
    dict_only: bool,

    /// Directory holding the train, eval and output files
    #[arg(long, default_value = "data/mwt")]
    data_dir: PathBuf,

    /// Training file, relative to the data directory
    #[arg(long)]
    train_file: Option<PathBuf>,

    /// Dev or evaluation file, relative to the data directory
    #[arg(long)]
    eval_file: Option<PathBuf>,

    /// Prediction output file, relative to the data directory
    #[arg(long)]
    output_file: PathBuf,

    /// Gold reference file
    #[arg(long)]
    gold_file: PathBuf,

    #[arg(long, default_value = "saved_models/mwt")]
    save_dir: PathBuf,

    /// Checkpoint file name inside the save directory
    #[arg(long)]
    save_name: Option<String>,

    #[arg(long, default_value = "params/mwt")]
    preset_dir: PathBuf,

    #[arg(long, default_value_t = 100)]
    hidden_dim: usize,
    #[arg(long, default_value_t = 50)]
    emb_dim: usize,
    #[arg(long, default_value_t = 1)]
    num_layers: usize,
    #[arg(long, default_value_t = 0.5)]
    emb_dropout: f32,
    #[arg(long, default_value_t = 0.5)]
    dropout: f32,
    #[arg(long, default_value_t = 50)]
    max_dec_len: usize,
    #[arg(long, default_value_t = 1)]
    beam_size: usize,

    /// Attention type: soft, mlp, linear or deep
    #[arg(long, default_value = "soft")]
    attn_type: AttentionType,

    /// Encoder to decoder transformation: no, linear, nonlinear or zero
    #[arg(short = 'e', long, default_value = "no")]
    enc2dec: Enc2Dec,

    /// Fraction of training examples to keep
    #[arg(long, default_value_t = 1.0)]
    sample_train: f64,

    /// Optimizer: sgd, adam or adamw
    #[arg(long, default_value = "adam")]
    optim: OptimizerKind,

    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    #[arg(long, default_value_t = 0.9)]
    lr_decay: f64,

    /// Decay the learning rate after this epoch
    #[arg(long, default_value_t = 30)]
    decay_epoch: usize,

    #[arg(long, default_value_t = 30)]
    num_epoch: usize,
    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    /// Gradient clipping threshold
    #[arg(long, default_value_t = 5.0)]
    max_grad_norm: f64,

    /// Log progress every k steps
    #[arg(long, default_value_t = 20)]
    log_step: usize,

    #[arg(long, default_value_t = 1234)]
    seed: u64,

    /// Ignore CUDA
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn config(&self) -> MwtConfig {
        let hyper = Hyperparameters {
            model: ModelConfig {
                hidden_dim: self.hidden_dim,
                emb_dim: self.emb_dim,
                num_layers: self.num_layers,
                emb_dropout: self.emb_dropout,
                dropout: self.dropout,
                max_dec_len: self.max_dec_len,
                beam_size: self.beam_size,
                attn_type: self.attn_type,
                enc2dec: self.enc2dec,
            },
            optim: OptimConfig {
                sample_train: self.sample_train,
                optim: self.optim,
                lr: self.lr,
                lr_decay: self.lr_decay,
                decay_epoch: self.decay_epoch,
                num_epoch: self.num_epoch,
                batch_size: self.batch_size,
                max_grad_norm: self.max_grad_norm,
                log_step: self.log_step,
            },
        };
        let strategy = if self.dict_only {
            Strategy::Dictionary
        } else {
            Strategy::Sequence
        };
        MwtConfig::new(&self.lang)
            .with_strategy(strategy)
            .with_hyperparameters(hyper)
            .with_seed(self.seed)
            .with_cpu(self.cpu)
    }

    fn paths(&self) -> Result<RunPaths> {
        let eval_file = self.eval_file.as_ref().context("--eval-file is required")?;
        let train_file = match self.mode {
            Mode::Train => self.train_file.as_ref().context("--train-file is required for training")?,
            Mode::Predict => self.train_file.as_ref().unwrap_or(eval_file),
        };
        Ok(RunPaths {
            train_file: self.data_dir.join(train_file),
            eval_file: self.data_dir.join(eval_file),
            output_file: self.data_dir.join(&self.output_file),
            gold_file: self.gold_file.clone(),
            save_dir: self.save_dir.clone(),
            save_name: self.save_name.clone(),
            preset_dir: Some(self.preset_dir.clone()),
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let orchestrator = Orchestrator::new(cli.paths()?);
    info!("Running MWT expander in {:?} mode", cli.mode);

    match cli.mode {
        Mode::Train => match orchestrator.train(cli.config(), cli.best_param)? {
            TrainOutcome::Skipped => info!("No model trained for {}", cli.lang),
            TrainOutcome::Trained(report) => info!(
                "Best dev F1 for {} = {:.2} at epoch {} (model: {})",
                cli.lang,
                report.best_score * 100.0,
                report.best_epoch,
                report.model_file.display()
            ),
        },
        Mode::Predict => {
            let report = orchestrator.evaluate(&cli.lang)?;
            println!("MWT expansion score:");
            match report.score {
                Some(score) => println!("{} {:.2}", report.lang, score.f1 * 100.0),
                None => println!("{} ", report.lang),
            }
        }
    }
    Ok(())
}
