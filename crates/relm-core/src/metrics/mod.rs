//! Evaluation metrics for correction and classification tasks.

pub mod align;
pub mod classification;
pub mod csc;

pub use align::{align_to_source, reconstruct, slot_chars};
pub use classification::{ClassificationReport, classification_compute};
pub use csc::{CscCounts, CscReport, LevelScores, Prf, csc_compute, difference};
