use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelmError;

/// The family a task belongs to, which decides its head and loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Chinese spelling correction through slot infilling.
    Csc,
    /// Sentence (pair) classification on the `[CLS]` position.
    Seq,
}

/// Supported tasks, addressed on the command line by their lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskName {
    /// SIGHAN 13/14/15 spelling check.
    Sighan,
    /// ECSpell domain spelling check (law, med, odw).
    Ecspell,
    /// SIGHAN-formatted auxiliary spelling data.
    Sghspell,
    /// TNEWS news title classification.
    Tnews,
    /// AFQMC question matching.
    Afqmc,
}

impl TaskName {
    /// Every task in canonical order.
    pub const ALL: [TaskName; 5] = [
        TaskName::Sighan,
        TaskName::Ecspell,
        TaskName::Sghspell,
        TaskName::Tnews,
        TaskName::Afqmc,
    ];

    #[must_use]
    pub fn kind(self) -> TaskKind {
        match self {
            Self::Sighan | Self::Ecspell | Self::Sghspell => TaskKind::Csc,
            Self::Tnews | Self::Afqmc => TaskKind::Seq,
        }
    }

    /// Lowercase name, also the dataset sub-directory under `data_dir`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sighan => "sighan",
            Self::Ecspell => "ecspell",
            Self::Sghspell => "sghspell",
            Self::Tnews => "tnews",
            Self::Afqmc => "afqmc",
        }
    }

    /// Parameter prefix of the classification head, `None` for correction tasks.
    #[must_use]
    pub fn head_prefix(self) -> Option<&'static str> {
        match self {
            Self::Tnews => Some("tnews_classifier"),
            Self::Afqmc => Some("qmc_classifier"),
            _ => None,
        }
    }

    /// Whether the examples carry a second sentence.
    #[must_use]
    pub fn is_pair(self) -> bool {
        matches!(self, Self::Afqmc)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = RelmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|task| task.as_str() == lower)
            .ok_or_else(|| RelmError::UnknownTask(s.to_string()))
    }
}
