use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while preparing data, masking or scoring.
#[derive(Debug, Error)]
pub enum RelmError {
    /// The run configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A task name is not one of the supported tasks.
    #[error("task not found: {0}")]
    UnknownTask(String),

    /// A mask mode string could not be parsed.
    #[error("unknown mask mode {0:?} (expected noerror, error or all)")]
    UnknownMaskMode(String),

    /// Source and target of a correction pair differ in length.
    #[error("source has {source_len} characters but target has {target_len}")]
    LengthMismatch {
        /// Number of source positions.
        source_len: usize,
        /// Number of target positions.
        target_len: usize,
    },

    /// A dataset file is missing.
    #[error("dataset file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// A dataset line could not be parsed.
    #[error("{}:{line}: {reason}", path.display())]
    MalformedLine {
        /// File the line came from.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Parallel source/target files have different line counts.
    #[error("{} has {source_lines} lines but {} has {target_lines}", source_path.display(), target_path.display())]
    LineCountMismatch {
        /// Source side file.
        source_path: PathBuf,
        /// Target side file.
        target_path: PathBuf,
        /// Lines in the source file.
        source_lines: usize,
        /// Lines in the target file.
        target_lines: usize,
    },

    /// The vocabulary could not be loaded or lacks a required token.
    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    /// Metric inputs are inconsistent.
    #[error("metric input error: {0}")]
    Metrics(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for relm-core operations.
pub type Result<T> = std::result::Result<T, RelmError>;
