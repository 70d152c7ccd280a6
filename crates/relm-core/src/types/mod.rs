pub mod example;
pub mod task;

pub use example::{CscExample, Example, SeqExample, TaskExamples, label_list};
pub use task::{TaskKind, TaskName};
