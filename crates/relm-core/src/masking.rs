//! # Masking Policy
//!
//! Chooses which source positions are hidden behind `[MASK]` during
//! training. With minimum-force-training every erroneous position is masked,
//! and the remaining candidates (chosen by [`MaskMode`]) are masked
//! independently with probability `rate`.
//!
//! The policy works on plain id sequences and knows nothing about the
//! backbone, so it can be tested in isolation.

use std::fmt;
use std::str::FromStr;

use oorandom::Rand32;
use serde::{Deserialize, Serialize};

use crate::error::{RelmError, Result};

/// Which positions are eligible for random masking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskMode {
    /// Correct positions only.
    #[default]
    NoError,
    /// Erroneous positions only.
    Error,
    /// Every position.
    All,
}

impl FromStr for MaskMode {
    type Err = RelmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "noerror" => Ok(Self::NoError),
            "error" => Ok(Self::Error),
            "all" => Ok(Self::All),
            _ => Err(RelmError::UnknownMaskMode(s.to_string())),
        }
    }
}

impl fmt::Display for MaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "noerror"),
            Self::Error => write!(f, "error"),
            Self::All => write!(f, "all"),
        }
    }
}

/// Positions picked by [`MaskingPolicy::select`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskSelection {
    /// Error positions masked unconditionally.
    pub forced: Vec<usize>,
    /// Positions drawn at the mask rate.
    pub sampled: Vec<usize>,
}

impl MaskSelection {
    /// All selected positions in ascending order.
    #[must_use]
    pub fn positions(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self.forced.iter().chain(&self.sampled).copied().collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    /// Number of selected positions; forced and sampled never overlap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forced.len() + self.sampled.len()
    }

    /// Whether nothing is masked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forced.is_empty() && self.sampled.is_empty()
    }
}

/// A source sentence with its selected positions replaced by the mask id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedInstance {
    /// Source ids with `[MASK]` at every selected position.
    pub input_ids: Vec<u32>,
    /// Ascending masked positions.
    pub positions: Vec<usize>,
    /// Target id for each entry of `positions`.
    pub labels: Vec<u32>,
}

impl MaskedInstance {
    /// Ids at positions that were left visible, paired with their index.
    pub fn unmasked(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        let mut masked = self.positions.iter().peekable();
        self.input_ids.iter().enumerate().filter_map(move |(i, &id)| {
            if masked.peek() == Some(&&i) {
                masked.next();
                None
            } else {
                Some((i, id))
            }
        })
    }
}

/// Masking configuration for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskingPolicy {
    /// Which positions are random candidates.
    pub mode: MaskMode,
    /// Probability of masking each random candidate, in `[0, 1]`.
    pub rate: f32,
    /// Mask every erroneous position regardless of `mode`.
    pub force_errors: bool,
}

impl MaskingPolicy {
    /// Random masking without forced positions.
    pub fn new(mode: MaskMode, rate: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
            return Err(RelmError::InvalidConfig(format!(
                "mask rate must lie in [0, 1], got {rate}"
            )));
        }
        Ok(Self {
            mode,
            rate,
            force_errors: false,
        })
    }

    /// Minimum-force-training: error positions plus random candidates.
    pub fn minimum_force(mode: MaskMode, rate: f32) -> Result<Self> {
        Ok(Self {
            force_errors: true,
            ..Self::new(mode, rate)?
        })
    }

    /// Pick masked positions for one source/target pair.
    pub fn select(&self, source: &[u32], target: &[u32], rng: &mut Rand32) -> Result<MaskSelection> {
        if source.len() != target.len() {
            return Err(RelmError::LengthMismatch {
                source_len: source.len(),
                target_len: target.len(),
            });
        }

        let mut selection = MaskSelection::default();
        for (i, (s, t)) in source.iter().zip(target).enumerate() {
            let wrong = s != t;
            if wrong && self.force_errors {
                selection.forced.push(i);
                continue;
            }
            let candidate = match self.mode {
                MaskMode::NoError => !wrong,
                MaskMode::Error => wrong,
                MaskMode::All => true,
            };
            if candidate && self.rate > 0.0 && rng.rand_float() < self.rate {
                selection.sampled.push(i);
            }
        }
        Ok(selection)
    }

    /// Select positions and build the masked instance.
    pub fn apply(
        &self,
        source: &[u32],
        target: &[u32],
        mask_id: u32,
        rng: &mut Rand32,
    ) -> Result<MaskedInstance> {
        let selection = self.select(source, target, rng)?;
        Ok(mask_positions(source, target, &selection.positions(), mask_id))
    }
}

/// Replace `positions` of `source` by `mask_id`, labelling each with the target id.
#[must_use]
pub fn mask_positions(source: &[u32], target: &[u32], positions: &[usize], mask_id: u32) -> MaskedInstance {
    let mut input_ids = source.to_vec();
    let mut labels = Vec::with_capacity(positions.len());
    for &pos in positions {
        input_ids[pos] = mask_id;
        labels.push(target[pos]);
    }
    MaskedInstance {
        input_ids,
        positions: positions.to_vec(),
        labels,
    }
}
