//! Dataset loading.

pub mod processor;

pub use processor::{CscProcessor, DataProcessor, SeqProcessor, Split, load_examples, processor_for};
