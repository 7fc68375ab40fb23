//! Score a system CoNLL-U file against its gold reference.
//!
//! Prints precision, recall and F1 of multi-word token expansion as JSON.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::debug;
use wakachi_core::score;

#[derive(Parser)]
#[command(name = "mwt-score")]
#[command(about = "Exact-match MWT expansion scorer")]
#[command(version)]
struct Cli {
    /// System output file
    system: PathBuf,

    /// Gold reference file
    gold: PathBuf,

    /// Report percentages instead of fractions
    #[arg(short, long)]
    percent: bool,
}

#[derive(Serialize)]
struct Report {
    precision: f64,
    recall: f64,
    f1: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    debug!("Scoring {} against {}", cli.system.display(), cli.gold.display());
    let s = score(&cli.system, &cli.gold).with_context(|| {
        format!("scoring {} against {}", cli.system.display(), cli.gold.display())
    })?;

    let scale = if cli.percent { 100.0 } else { 1.0 };
    let report = Report {
        precision: s.precision * scale,
        recall: s.recall * scale,
        f1: s.f1 * scale,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
