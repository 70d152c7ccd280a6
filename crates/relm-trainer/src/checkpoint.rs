//! Checkpoint naming, best-k retention and trainer state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Checkpoints kept on disk.
pub const KEEP_BEST: usize = 3;

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^step-(\d+)(?:_f1-(\d+(?:\.\d+)?))?\.safetensors$").ok())
        .as_ref()
}

/// `step-{N}_f1-{F:.2}.safetensors`, or `step-{N}.safetensors` without a metric.
#[must_use]
pub fn checkpoint_name(step: usize, f1: Option<f64>) -> String {
    match f1 {
        Some(f1) => format!("step-{step}_f1-{f1:.2}.safetensors"),
        None => format!("step-{step}.safetensors"),
    }
}

/// Optimizer state saved beside a checkpoint: `step-4.safetensors` gives
/// `step-4.optimizer.safetensors`. Never matched by [`parse_checkpoint_name`].
#[must_use]
pub fn optimizer_path(checkpoint: &Path) -> PathBuf {
    let stem = checkpoint
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    checkpoint.with_file_name(format!("{stem}.optimizer.safetensors"))
}

/// Inverse of [`checkpoint_name`].
#[must_use]
pub fn parse_checkpoint_name(name: &str) -> Option<(usize, Option<f64>)> {
    let caps = name_pattern()?.captures(name)?;
    let step = caps.get(1)?.as_str().parse().ok()?;
    let f1 = caps.get(2).and_then(|m| m.as_str().parse().ok());
    Some((step, f1))
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    /// F1 when evaluated, otherwise the step, so newer wins.
    score: f64,
    path: PathBuf,
}

/// Keeps the best [`KEEP_BEST`] checkpoints of an output directory.
#[derive(Debug)]
pub struct CheckpointLedger {
    dir: PathBuf,
    keep: usize,
    entries: Vec<Entry>,
}

impl CheckpointLedger {
    /// Rebuild the ledger from checkpoints already in `dir`.
    pub fn scan(dir: &Path, keep: usize) -> Result<Self> {
        let mut entries = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
                let path = entry?.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some((step, f1)) = parse_checkpoint_name(name) {
                    debug!(checkpoint = name, "found existing checkpoint");
                    entries.push(Entry {
                        score: f1.unwrap_or(step as f64),
                        path,
                    });
                }
            }
        }
        let mut ledger = Self {
            dir: dir.to_path_buf(),
            keep: keep.max(1),
            entries,
        };
        ledger.sort();
        Ok(ledger)
    }

    #[must_use]
    pub fn path_for(&self, step: usize, f1: Option<f64>) -> PathBuf {
        self.dir.join(checkpoint_name(step, f1))
    }

    /// Register a written checkpoint and delete whatever falls out of the
    /// top-k, together with its optimizer state.
    pub fn record(&mut self, path: PathBuf, score: f64) -> Result<Vec<PathBuf>> {
        self.entries.retain(|e| e.path != path);
        self.entries.push(Entry { score, path });
        self.sort();

        let mut removed = Vec::new();
        while self.entries.len() > self.keep {
            if let Some(worst) = self.entries.pop() {
                for path in [worst.path.clone(), optimizer_path(&worst.path)] {
                    if path.exists() {
                        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
                    }
                }
                info!(path = %worst.path.display(), "removed checkpoint");
                removed.push(worst.path);
            }
        }
        Ok(removed)
    }

    /// Best checkpoint so far.
    #[must_use]
    pub fn best(&self) -> Option<&Path> {
        self.entries.first().map(|e| e.path.as_path())
    }

    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        self.entries.iter().map(|e| e.path.as_path()).collect()
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    }
}

/// Written next to the checkpoints after every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub eval_f1: Option<f64>,
    pub checkpoint: String,
    pub best_checkpoint: Option<String>,
}

impl TrainerState {
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(TRAINER_STATE_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TRAINER_STATE_FILE);
        let content = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}
