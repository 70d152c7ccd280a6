//! # ReLM Core
//!
//! Model-free building blocks for training a masked language model to
//! correct Chinese spelling errors by rephrasing: the whole sentence is
//! regenerated through slot infilling instead of being tagged per character.
//!
//! ## Quick Start
//!
//! ```rust
//! use relm_core::metrics::csc_compute;
//!
//! let chars = |s: &str| s.chars().collect::<Vec<_>>();
//! let report = csc_compute(
//!     &[chars("我今天很高心")],
//!     &[chars("我今天很高兴")],
//!     &[chars("我今天很高兴")],
//! )
//! .unwrap();
//!
//! assert_eq!(report.character.correction.f1, 1.0);
//! ```
pub mod config;
pub mod data;
pub mod error;
pub mod masking;
pub mod metrics;
pub mod rephrase;
pub mod tokenizer;
pub mod types;

// Re-export primary API
pub use config::{LrSchedule, RunConfig};
pub use data::{DataProcessor, Split, load_examples};
pub use error::{RelmError, Result};
pub use masking::{MaskMode, MaskSelection, MaskedInstance, MaskingPolicy};
pub use metrics::{ClassificationReport, CscReport, Prf, csc_compute, reconstruct};
pub use rephrase::{Encoded, EncodedCsc, EncodedSeq, Feature, IGNORE_INDEX, RephraseTemplate};
pub use tokenizer::{CharTokenizer, SpecialTokens};
pub use types::{CscExample, Example, SeqExample, TaskExamples, TaskKind, TaskName};
