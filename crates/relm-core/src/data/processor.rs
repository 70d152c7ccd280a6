//! # Task Processors
//!
//! Read raw datasets from `{data_dir}/{task}/{split}_{name}.{ext}`.
//!
//! Correction tasks accept `source\ttarget` lines in a `.txt` file, or
//! parallel `.src` / `.trg` files. Classification tasks accept CLUE JSON
//! lines in a `.json` file, or tab separated `text[\ttext_b]\tlabel`
//! lines in a `.txt` file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{RelmError, Result};
use crate::types::{CscExample, Example, SeqExample, TaskExamples, TaskKind, TaskName};

/// Dataset split, the prefix of every file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads the examples of one task.
pub trait DataProcessor {
    fn task(&self) -> TaskName;

    /// Read `{split}_{name}` from the task directory.
    fn read(&self, task_dir: &Path, split: Split, name: &str) -> Result<Vec<Example>>;

    fn train_examples(&self, task_dir: &Path, name: &str) -> Result<Vec<Example>> {
        self.read(task_dir, Split::Train, name)
    }

    fn test_examples(&self, task_dir: &Path, name: &str) -> Result<Vec<Example>> {
        self.read(task_dir, Split::Test, name)
    }
}

/// Processor for `sighan`, `ecspell` and `sghspell`.
#[derive(Debug, Clone, Copy)]
pub struct CscProcessor {
    task: TaskName,
}

/// Processor for `tnews` and `afqmc`.
#[derive(Debug, Clone, Copy)]
pub struct SeqProcessor {
    task: TaskName,
}

/// Pick the processor for a task.
#[must_use]
pub fn processor_for(task: TaskName) -> Box<dyn DataProcessor> {
    match task.kind() {
        TaskKind::Csc => Box::new(CscProcessor { task }),
        TaskKind::Seq => Box::new(SeqProcessor { task }),
    }
}

/// Load `{data_dir}/{task}/{split}_{name}`.
pub fn load_examples(data_dir: &Path, task: TaskName, split: Split, name: &str) -> Result<TaskExamples> {
    let task_dir = data_dir.join(task.as_str());
    let examples = processor_for(task).read(&task_dir, split, name)?;
    info!(
        task = %task,
        split = %split,
        dataset = name,
        examples = examples.len(),
        "loaded dataset"
    );
    Ok(TaskExamples { task, examples })
}

fn stem_path(task_dir: &Path, split: Split, name: &str, ext: &str) -> PathBuf {
    task_dir.join(format!("{split}_{name}.{ext}"))
}

fn guid(split: Split, name: &str, index: usize) -> String {
    format!("{split}_{name}-{index}")
}

/// Every line of `path`, numbered from 1, with trailing blank lines removed.
fn read_raw_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    if !path.is_file() {
        return Err(RelmError::MissingFile(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let mut lines: Vec<(usize, String)> = content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r').to_string()))
        .collect();
    while lines.last().is_some_and(|(_, l)| l.trim().is_empty()) {
        lines.pop();
    }
    Ok(lines)
}

/// Non-blank lines of `path`, numbered from 1.
fn read_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    Ok(read_raw_lines(path)?
        .into_iter()
        .filter(|(_, l)| !l.trim().is_empty())
        .collect())
}

fn malformed(path: &Path, line: usize, reason: impl Into<String>) -> RelmError {
    RelmError::MalformedLine {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

impl CscProcessor {
    fn from_tsv(&self, path: &Path, split: Split, name: &str) -> Result<Vec<Example>> {
        let mut examples = Vec::new();
        for (line_no, line) in read_lines(path)? {
            let mut cols = line.split('\t');
            let (Some(source), Some(target), None) = (cols.next(), cols.next(), cols.next()) else {
                return Err(malformed(path, line_no, "expected `source<TAB>target`"));
            };
            let example = CscExample::new(guid(split, name, examples.len()), source, target)
                .map_err(|e| malformed(path, line_no, e.to_string()))?;
            examples.push(Example::Csc(example));
        }
        Ok(examples)
    }

    /// Pairs are matched by line number; a line blank on only one side is an error.
    fn from_parallel(&self, src: &Path, trg: &Path, split: Split, name: &str) -> Result<Vec<Example>> {
        let sources = read_raw_lines(src)?;
        let targets = read_raw_lines(trg)?;
        if sources.len() != targets.len() {
            return Err(RelmError::LineCountMismatch {
                source_path: src.to_path_buf(),
                target_path: trg.to_path_buf(),
                source_lines: sources.len(),
                target_lines: targets.len(),
            });
        }
        let mut examples = Vec::with_capacity(sources.len());
        for ((line_no, s), (_, t)) in sources.iter().zip(&targets) {
            match (s.trim().is_empty(), t.trim().is_empty()) {
                (true, true) => continue,
                (true, false) => return Err(malformed(src, *line_no, "blank source for a non-blank target")),
                (false, true) => return Err(malformed(trg, *line_no, "blank target for a non-blank source")),
                (false, false) => {}
            }
            let example = CscExample::new(guid(split, name, examples.len()), s, t)
                .map_err(|e| malformed(src, *line_no, e.to_string()))?;
            examples.push(Example::Csc(example));
        }
        Ok(examples)
    }
}

impl DataProcessor for CscProcessor {
    fn task(&self) -> TaskName {
        self.task
    }

    fn read(&self, task_dir: &Path, split: Split, name: &str) -> Result<Vec<Example>> {
        let tsv = stem_path(task_dir, split, name, "txt");
        if tsv.is_file() {
            debug!(path = %tsv.display(), "reading tab separated pairs");
            return self.from_tsv(&tsv, split, name);
        }
        let src = stem_path(task_dir, split, name, "src");
        let trg = stem_path(task_dir, split, name, "trg");
        if src.is_file() || trg.is_file() {
            debug!(path = %src.display(), "reading parallel files");
            return self.from_parallel(&src, &trg, split, name);
        }
        Err(RelmError::MissingFile(tsv))
    }
}

#[derive(Debug, Deserialize)]
struct ClueRecord {
    #[serde(default)]
    sentence: Option<String>,
    #[serde(default)]
    sentence1: Option<String>,
    #[serde(default)]
    sentence2: Option<String>,
    #[serde(default)]
    label: Value,
}

fn label_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl SeqProcessor {
    fn from_json(&self, path: &Path, split: Split, name: &str) -> Result<Vec<Example>> {
        let mut examples = Vec::new();
        for (line_no, line) in read_lines(path)? {
            let record: ClueRecord =
                serde_json::from_str(&line).map_err(|e| malformed(path, line_no, e.to_string()))?;
            let label = label_string(&record.label)
                .ok_or_else(|| malformed(path, line_no, "missing label"))?;
            let (text_a, text_b) = if self.task.is_pair() {
                (record.sentence1, record.sentence2)
            } else {
                (record.sentence, None)
            };
            let text_a = text_a.ok_or_else(|| malformed(path, line_no, "missing sentence"))?;
            if self.task.is_pair() && text_b.is_none() {
                return Err(malformed(path, line_no, "missing sentence2"));
            }
            examples.push(Example::Seq(SeqExample {
                guid: guid(split, name, examples.len()),
                text_a,
                text_b,
                label,
            }));
        }
        Ok(examples)
    }

    fn from_tsv(&self, path: &Path, split: Split, name: &str) -> Result<Vec<Example>> {
        let columns = if self.task.is_pair() { 3 } else { 2 };
        let mut examples = Vec::new();
        for (line_no, line) in read_lines(path)? {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() != columns {
                return Err(malformed(
                    path,
                    line_no,
                    format!("expected {columns} tab separated columns, found {}", cols.len()),
                ));
            }
            examples.push(Example::Seq(SeqExample {
                guid: guid(split, name, examples.len()),
                text_a: cols[0].to_string(),
                text_b: self.task.is_pair().then(|| cols[1].to_string()),
                label: cols[columns - 1].trim().to_string(),
            }));
        }
        Ok(examples)
    }
}

impl DataProcessor for SeqProcessor {
    fn task(&self) -> TaskName {
        self.task
    }

    fn read(&self, task_dir: &Path, split: Split, name: &str) -> Result<Vec<Example>> {
        let json = stem_path(task_dir, split, name, "json");
        if json.is_file() {
            return self.from_json(&json, split, name);
        }
        let tsv = stem_path(task_dir, split, name, "txt");
        if tsv.is_file() {
            return self.from_tsv(&tsv, split, name);
        }
        Err(RelmError::MissingFile(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, task: &str, file: &str, content: &str) {
        let task_dir = dir.join(task);
        fs::create_dir_all(&task_dir).unwrap();
        fs::write(task_dir.join(file), content).unwrap();
    }

    #[test]
    fn test_csc_tsv() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "ecspell", "train_law.txt", "我 今 天 很 高 心\t我今天很高兴\n\n他们在学校\t他们在学校\n");
        let loaded = load_examples(dir, TaskName::Ecspell, Split::Train, "law").unwrap();
        assert_eq!(loaded.examples.len(), 2);
        let Example::Csc(first) = &loaded.examples[0] else {
            panic!("expected a correction example");
        };
        assert_eq!(first.guid, "train_law-0");
        assert_eq!(first.error_positions(), vec![5]);
    }

    #[test]
    fn test_csc_length_mismatch_reports_line() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "sighan", "test_15.txt", "我今天\t我今天\n我今天\t我今天很\n");
        let err = load_examples(dir, TaskName::Sighan, Split::Test, "15").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("test_15.txt:2"), "{msg}");
    }

    #[test]
    fn test_csc_parallel_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "sighan", "train_hybrid.src", "我今天很高心\n他们在学校\n");
        write(dir, "sighan", "train_hybrid.trg", "我今天很高兴\n他们在学校\n");
        let loaded = load_examples(dir, TaskName::Sighan, Split::Train, "hybrid").unwrap();
        assert_eq!(loaded.examples.len(), 2);

        write(dir, "sighan", "train_short.src", "我今天很高心\n他们在学校\n");
        write(dir, "sighan", "train_short.trg", "我今天很高兴\n");
        let err = load_examples(dir, TaskName::Sighan, Split::Train, "short").unwrap_err();
        assert!(matches!(err, RelmError::LineCountMismatch { source_lines: 2, target_lines: 1, .. }));
    }

    #[test]
    fn test_parallel_blank_lines_pair_by_line_number() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "sighan", "train_gap.src", "我今天很高心\n\n他们在学校\n\n");
        write(dir, "sighan", "train_gap.trg", "我今天很高兴\n\n他们在学校\n");
        let loaded = load_examples(dir, TaskName::Sighan, Split::Train, "gap").unwrap();
        assert_eq!(loaded.examples.len(), 2);
        let Example::Csc(second) = &loaded.examples[1] else {
            panic!("expected a correction example");
        };
        assert_eq!(second.guid, "train_gap-1");
        assert!(!second.has_error());

        write(dir, "sighan", "train_shift.src", "我今天很高心\n\n他们在学校\n他们在学校\n");
        write(dir, "sighan", "train_shift.trg", "我今天很高兴\n他们在学校\n\n他们在学校\n");
        let err = load_examples(dir, TaskName::Sighan, Split::Train, "shift").unwrap_err();
        assert!(err.to_string().contains("train_shift.src:2"), "{err}");
    }

    #[test]
    fn test_missing_dataset() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        let err = load_examples(dir, TaskName::Ecspell, Split::Test, "med").unwrap_err();
        assert!(matches!(err, RelmError::MissingFile(_)));
    }

    #[test]
    fn test_malformed_csc_line() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "ecspell", "train_odw.txt", "只有一列\n");
        let err = load_examples(dir, TaskName::Ecspell, Split::Train, "odw").unwrap_err();
        assert!(err.to_string().contains(":1:"), "{err}");
    }

    #[test]
    fn test_clue_json_pair() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(
            dir,
            "afqmc",
            "train_base.json",
            "{\"sentence1\": \"好不好\", \"sentence2\": \"坏不坏\", \"label\": \"0\"}\n\
             {\"sentence1\": \"是不是\", \"sentence2\": \"是否\", \"label\": 1}\n",
        );
        let loaded = load_examples(dir, TaskName::Afqmc, Split::Train, "base").unwrap();
        let labels: Vec<String> = loaded
            .examples
            .iter()
            .filter_map(|e| match e {
                Example::Seq(s) => Some(s.label.clone()),
                Example::Csc(_) => None,
            })
            .collect();
        assert_eq!(labels, vec!["0", "1"]);
    }

    #[test]
    fn test_clue_json_missing_field() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "tnews", "train_base.json", "{\"label\": \"100\"}\n");
        assert!(load_examples(dir, TaskName::Tnews, Split::Train, "base").is_err());
    }

    #[test]
    fn test_seq_tsv() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(dir, "tnews", "test_base.txt", "今天天气好\t104\n学校读书\t108\n");
        let loaded = load_examples(dir, TaskName::Tnews, Split::Test, "base").unwrap();
        let Example::Seq(second) = &loaded.examples[1] else {
            panic!("expected a classification example");
        };
        assert_eq!(second.label, "108");
        assert!(second.text_b.is_none());
    }
}
