use serde::{Deserialize, Serialize};

use super::task::TaskName;
use crate::error::{RelmError, Result};

/// A correction pair. Source and target always have the same length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CscExample {
    /// Identifier such as `train_law-17`.
    pub guid: String,
    /// Erroneous sentence, one entry per character.
    pub source: Vec<char>,
    /// Corrected sentence.
    pub target: Vec<char>,
}

impl CscExample {
    /// Build a pair from raw sentences. Whitespace between characters is dropped.
    pub fn new(guid: impl Into<String>, source: &str, target: &str) -> Result<Self> {
        let source = split_chars(source);
        let target = split_chars(target);
        if source.len() != target.len() {
            return Err(RelmError::LengthMismatch {
                source_len: source.len(),
                target_len: target.len(),
            });
        }
        Ok(Self {
            guid: guid.into(),
            source,
            target,
        })
    }

    /// Per-position flags, `true` where the source character is wrong.
    #[must_use]
    pub fn error_flags(&self) -> Vec<bool> {
        self.source
            .iter()
            .zip(&self.target)
            .map(|(s, t)| s != t)
            .collect()
    }

    /// Indices of erroneous positions.
    #[must_use]
    pub fn error_positions(&self) -> Vec<usize> {
        self.error_flags()
            .into_iter()
            .enumerate()
            .filter_map(|(i, wrong)| wrong.then_some(i))
            .collect()
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.source != self.target
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.source.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

/// A classification example for the auxiliary tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqExample {
    pub guid: String,
    pub text_a: String,
    pub text_b: Option<String>,
    pub label: String,
}

/// Any example a task processor can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Example {
    Csc(CscExample),
    Seq(SeqExample),
}

impl Example {
    #[must_use]
    pub fn guid(&self) -> &str {
        match self {
            Self::Csc(e) => &e.guid,
            Self::Seq(e) => &e.guid,
        }
    }
}

/// Sorted, de-duplicated label set of a classification dataset.
#[must_use]
pub fn label_list(examples: &[SeqExample]) -> Vec<String> {
    let mut labels: Vec<String> = examples.iter().map(|e| e.label.clone()).collect();
    labels.sort();
    labels.dedup();
    labels
}

/// Examples of one task together with the task name.
#[derive(Debug, Clone)]
pub struct TaskExamples {
    pub task: TaskName,
    pub examples: Vec<Example>,
}

pub(crate) fn split_chars(sentence: &str) -> Vec<char> {
    sentence.chars().filter(|c| !c.is_whitespace()).collect()
}
