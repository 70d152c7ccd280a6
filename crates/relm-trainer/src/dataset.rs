//! Examples of one task together with their encoding.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use relm_core::types::label_list;
use relm_core::{
    CharTokenizer, CscExample, Encoded, EncodedCsc, EncodedSeq, Example, SeqExample, TaskExamples,
    TaskKind, TaskName,
};

/// File in the output directory holding the label list of every
/// classification task.
pub const LABELS_FILE: &str = "labels.json";

/// One task's dataset, encoded once and re-masked per batch.
#[derive(Debug, Clone)]
pub struct TaskData {
    pub task: TaskName,
    pub name: String,
    pub examples: Vec<Example>,
    pub encoded: Vec<Encoded>,
    /// Class labels, empty for correction tasks.
    pub label_list: Vec<String>,
}

impl TaskData {
    /// Encode `loaded`. Classification tasks use `labels` when given,
    /// otherwise the sorted label set of the examples.
    pub fn encode(
        loaded: TaskExamples,
        name: &str,
        tokenizer: &CharTokenizer,
        labels: Option<&[String]>,
    ) -> Result<Self> {
        let TaskExamples { task, examples } = loaded;
        let label_list = match task.kind() {
            TaskKind::Csc => Vec::new(),
            TaskKind::Seq => match labels {
                Some(labels) => labels.to_vec(),
                None => {
                    let seq: Vec<SeqExample> = examples
                        .iter()
                        .filter_map(|e| match e {
                            Example::Seq(s) => Some(s.clone()),
                            Example::Csc(_) => None,
                        })
                        .collect();
                    label_list(&seq)
                }
            },
        };

        let encoded = examples
            .iter()
            .map(|example| match example {
                Example::Csc(csc) => Ok(Encoded::Csc(EncodedCsc::new(csc, tokenizer))),
                Example::Seq(seq) => Ok(Encoded::Seq(EncodedSeq::new(seq, tokenizer, &label_list)?)),
            })
            .collect::<relm_core::Result<Vec<_>>>()
            .with_context(|| format!("encoding {task} dataset {name}"))?;

        Ok(Self {
            task,
            name: name.to_string(),
            examples,
            encoded,
            label_list,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Correction example at `index`, if this is a correction task.
    #[must_use]
    pub fn csc_example(&self, index: usize) -> Option<&CscExample> {
        match self.examples.get(index)? {
            Example::Csc(e) => Some(e),
            Example::Seq(_) => None,
        }
    }
}

/// Label lists keyed by task name, as saved in [`LABELS_FILE`].
pub type LabelLists = BTreeMap<TaskName, Vec<String>>;

pub fn save_label_lists(dir: &Path, labels: &LabelLists) -> Result<()> {
    let path = dir.join(LABELS_FILE);
    fs::write(&path, serde_json::to_string_pretty(labels)?)
        .with_context(|| format!("writing {}", path.display()))
}

/// Label lists saved by an earlier training run, empty when there are none.
pub fn load_label_lists(dir: &Path) -> Result<LabelLists> {
    let path = dir.join(LABELS_FILE);
    if !path.is_file() {
        return Ok(LabelLists::new());
    }
    let content = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}
