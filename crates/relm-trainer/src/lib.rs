//! # ReLM Trainer
//!
//! Fine-tunes a BERT masked language model (candle) to correct Chinese
//! spelling by rephrasing, optionally alongside classification tasks, and
//! evaluates the result.
//!
//! [`pipeline::run`] drives a whole run from a validated
//! [`relm_core::RunConfig`]; the `relm-train` binary builds that
//! configuration from [`cli::Args`].

pub mod batch;
pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod evaluator;
pub mod model;
pub mod optim;
pub mod pipeline;
pub mod preview;
pub mod schedule;
pub mod trainer;

pub use cli::Args;
pub use dataset::TaskData;
pub use evaluator::{EvalMetrics, EvalOutcome, Evaluator};
pub use model::{FreezeMode, RelmModel};
pub use pipeline::run;
pub use trainer::{TrainSummary, Trainer};
