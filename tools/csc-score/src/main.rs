use std::io::{self, BufRead};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relm_core::metrics::{align_to_source, csc_compute};
use serde::Deserialize;
use tracing::{info, warn};

/// Score (source, target, prediction) JSON lines read from stdin.
#[derive(Parser, Debug)]
#[command(name = "csc-score", version)]
struct Args {
    /// Also write sents.tp / sents.fp / sents.fn / sents.wp into this directory.
    #[arg(long)]
    sents_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ScoreInput {
    source: String,
    target: String,
    prediction: String,
}

fn chars(s: &str) -> Vec<char> {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let stdin = io::stdin();

    let mut sources = Vec::new();
    let mut targets = Vec::new();
    let mut predictions = Vec::new();

    for (i, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let input: ScoreInput =
            serde_json::from_str(line).with_context(|| format!("line {}: invalid JSON", i + 1))?;
        let source = chars(&input.source);
        let target = chars(&input.target);
        if source.len() != target.len() {
            anyhow::bail!(
                "line {}: source has {} characters but target has {}",
                i + 1,
                source.len(),
                target.len()
            );
        }
        let generated = chars(&input.prediction);
        if generated.len() != source.len() {
            warn!(line = i + 1, "prediction length differs from source, aligning");
        }
        predictions.push(align_to_source(&source, &generated));
        sources.push(source);
        targets.push(target);
    }

    let report = csc_compute(&sources, &targets, &predictions)?;
    info!(
        sentences = report.counts.sentences,
        f1 = report.sentence.correction.f1,
        "scored"
    );

    if let Some(dir) = &args.sents_dir {
        report
            .write_sentence_files(dir)
            .with_context(|| format!("writing sentence files to {}", dir.display()))?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
