//! Inference over a held-out set and metric reporting.
//!
//! Correction sets are run with every target slot masked; the arg-max token
//! of each slot is decoded and aligned back to the source before scoring.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{D, DType, Tensor};
use candle_nn::loss::cross_entropy;
use oorandom::Rand32;
use tracing::info;

use relm_core::metrics::{ClassificationReport, CscReport, classification_compute, csc_compute, reconstruct};
use relm_core::{CharTokenizer, Encoded, RephraseTemplate, TaskKind, TaskName};

use crate::batch::{Batch, DataLoader};
use crate::dataset::TaskData;
use crate::model::RelmModel;

pub const EVAL_RESULTS_FILE: &str = "eval_results.txt";

#[derive(Debug, Clone)]
pub enum EvalMetrics {
    Csc(CscReport),
    Seq(ClassificationReport),
}

/// Metrics of one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub task: TaskName,
    pub eval_loss: f64,
    pub metrics: EvalMetrics,
}

impl EvalOutcome {
    /// F1 in percent: sentence-level correction F1 or macro-F1.
    #[must_use]
    pub fn f1(&self) -> f64 {
        match &self.metrics {
            EvalMetrics::Csc(r) => r.sentence.correction.f1 * 100.0,
            EvalMetrics::Seq(r) => r.macro_f1 * 100.0,
        }
    }

    /// Line appended to `eval_results.txt`.
    #[must_use]
    pub fn results_line(&self, global_step: usize) -> String {
        match &self.metrics {
            EvalMetrics::Csc(r) => format!(
                "Global step = {global_step} | eval precision = {:.2} | eval recall = {:.2} | eval f1 = {:.2} | eval fp rate = {:.2}",
                r.sentence.correction.precision * 100.0,
                r.sentence.correction.recall * 100.0,
                r.sentence.correction.f1 * 100.0,
                r.false_positive_rate * 100.0,
            ),
            EvalMetrics::Seq(r) => format!(
                "Global step = {global_step} |  eval f1 = {:.2} |  eval acc = {:.2} ",
                r.macro_f1 * 100.0,
                r.accuracy * 100.0,
            ),
        }
    }

    /// Write the sentence files (correction tasks) and append the result line.
    pub fn write(&self, output_dir: &Path, global_step: usize) -> Result<()> {
        if let EvalMetrics::Csc(report) = &self.metrics {
            report.write_sentence_files(output_dir)?;
        }
        let path = output_dir.join(EVAL_RESULTS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        writeln!(file, "{}", self.results_line(global_step))?;
        Ok(())
    }

    pub fn log(&self, global_step: usize, train_loss: Option<f64>) {
        info!("***** Eval results *****");
        match &self.metrics {
            EvalMetrics::Csc(r) => info!(
                global_step,
                task = %self.task,
                loss = train_loss,
                eval_loss = self.eval_loss,
                eval_p = r.sentence.correction.precision * 100.0,
                eval_r = r.sentence.correction.recall * 100.0,
                eval_f1 = r.sentence.correction.f1 * 100.0,
                eval_fpr = r.false_positive_rate * 100.0,
                char_f1 = r.character.correction.f1 * 100.0,
                "correction metrics"
            ),
            EvalMetrics::Seq(r) => info!(
                global_step,
                task = %self.task,
                loss = train_loss,
                eval_loss = self.eval_loss,
                eval_acc = r.accuracy * 100.0,
                eval_f1 = r.macro_f1 * 100.0,
                "classification metrics"
            ),
        }
    }
}

/// Runs a model over an evaluation set.
pub struct Evaluator<'a> {
    model: &'a RelmModel,
    tokenizer: &'a CharTokenizer,
    template: &'a RephraseTemplate,
    batch_size: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        model: &'a RelmModel,
        tokenizer: &'a CharTokenizer,
        template: &'a RephraseTemplate,
        batch_size: usize,
    ) -> Self {
        Self {
            model,
            tokenizer,
            template,
            batch_size,
        }
    }

    pub fn evaluate(&self, data: &TaskData) -> Result<EvalOutcome> {
        info!("***** Running evaluation *****");
        info!(
            task = %data.task,
            dataset = %data.name,
            examples = data.len(),
            batch_size = self.batch_size,
            "evaluation set"
        );
        match data.task.kind() {
            TaskKind::Csc => self.evaluate_csc(data),
            TaskKind::Seq => self.evaluate_seq(data),
        }
    }

    fn batch(&self, data: &TaskData, indices: &[usize]) -> Result<Batch> {
        // no masking policy, so the generator is never drawn from
        let mut rng = Rand32::new(0);
        let features = indices
            .iter()
            .map(|&i| self.template.feature(data.task, &data.encoded[i], None, &mut rng))
            .collect::<relm_core::Result<Vec<_>>>()?;
        Batch::new(features, self.model.device())
    }

    fn evaluate_csc(&self, data: &TaskData) -> Result<EvalOutcome> {
        let mut sources = Vec::with_capacity(data.len());
        let mut targets = Vec::with_capacity(data.len());
        let mut predictions = Vec::with_capacity(data.len());
        let mut loss_sum = 0.0;
        let mut loss_batches = 0usize;

        for indices in DataLoader::new(data.len(), self.batch_size).sequential() {
            let batch = self.batch(data, &indices)?;
            let rows: Vec<u32> = (0..batch.len() as u32).collect();
            let (positions, labels) = batch.labelled_positions(&rows);

            let predicted: Vec<u32> = if positions.is_empty() {
                Vec::new()
            } else {
                let hidden = self.model.hidden(&batch)?;
                let logits = self.model.mlm_logits_at(&hidden, &positions)?.to_dtype(DType::F32)?;
                let labels = Tensor::new(labels.as_slice(), self.model.device())?;
                loss_sum += f64::from(cross_entropy(&logits, &labels)?.to_scalar::<f32>()?);
                loss_batches += 1;
                logits.argmax(D::Minus1)?.to_vec1::<u32>()?
            };

            let mut offset = 0;
            for (&index, feature) in indices.iter().zip(&batch.features) {
                let Some(example) = data.csc_example(index) else {
                    continue;
                };
                let n = feature.source_len;
                let slots = &predicted[offset..offset + n];
                offset += n;

                let mut prediction = reconstruct(self.tokenizer, &example.source[..n], slots);
                prediction.extend_from_slice(&example.source[n..]);
                predictions.push(prediction);
                sources.push(example.source.clone());
                targets.push(example.target.clone());
            }
        }

        let report = csc_compute(&sources, &targets, &predictions)?;
        Ok(EvalOutcome {
            task: data.task,
            eval_loss: loss_sum / loss_batches.max(1) as f64,
            metrics: EvalMetrics::Csc(report),
        })
    }

    fn evaluate_seq(&self, data: &TaskData) -> Result<EvalOutcome> {
        let mut predictions = Vec::with_capacity(data.len());
        let mut labels = Vec::with_capacity(data.len());
        let mut loss_sum = 0.0;
        let mut loss_batches = 0usize;

        for indices in DataLoader::new(data.len(), self.batch_size).sequential() {
            let batch = self.batch(data, &indices)?;
            let rows: Vec<u32> = (0..batch.len() as u32).collect();
            let gold: Vec<u32> = indices
                .iter()
                .filter_map(|&i| match &data.encoded[i] {
                    Encoded::Seq(s) => Some(s.label),
                    Encoded::Csc(_) => None,
                })
                .collect();

            let hidden = self.model.hidden(&batch)?;
            let logits = self
                .model
                .class_logits(&hidden, data.task, &rows)?
                .to_dtype(DType::F32)?;
            let gold_tensor = Tensor::new(gold.as_slice(), self.model.device())?;
            loss_sum += f64::from(cross_entropy(&logits, &gold_tensor)?.to_scalar::<f32>()?);
            loss_batches += 1;

            predictions.extend(logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
            labels.extend(gold);
        }

        let report = classification_compute(&predictions, &labels)?;
        Ok(EvalOutcome {
            task: data.task,
            eval_loss: loss_sum / loss_batches.max(1) as f64,
            metrics: EvalMetrics::Seq(report),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relm_core::metrics::csc_compute;
    use relm_core::{CscExample, Example, SeqExample, TaskExamples};

    use crate::model::tests::tiny_model;

    fn tokenizer() -> CharTokenizer {
        CharTokenizer::from_tokens([
            "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "[unused1]", "[unused2]", "我", "今", "天",
            "很", "高", "心", "兴", "好", "坏",
        ])
        .unwrap()
    }

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_csc_results_line() {
        let report = csc_compute(
            &[chars("我今天很高心")],
            &[chars("我今天很高兴")],
            &[chars("我今天很高兴")],
        )
        .unwrap();
        let outcome = EvalOutcome {
            task: TaskName::Ecspell,
            eval_loss: 0.1,
            metrics: EvalMetrics::Csc(report),
        };
        assert_eq!(outcome.f1(), 100.0);
        assert_eq!(
            outcome.results_line(200),
            "Global step = 200 | eval precision = 100.00 | eval recall = 100.00 | eval f1 = 100.00 | eval fp rate = 0.00"
        );
    }

    #[test]
    fn test_write_appends() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path();
        let outcome = EvalOutcome {
            task: TaskName::Tnews,
            eval_loss: 0.5,
            metrics: EvalMetrics::Seq(classification_compute(&[0, 1], &[0, 0]).unwrap()),
        };
        outcome.write(dir, 100).unwrap();
        outcome.write(dir, 200).unwrap();
        let content = std::fs::read_to_string(dir.join(EVAL_RESULTS_FILE)).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("Global step = 100 |  eval f1 = "));
        assert!(!dir.join("sents.tp").exists());
    }

    #[test]
    fn test_evaluate_classification_set() {
        let tok = tokenizer();
        let examples = [("好天", "1"), ("坏天", "0"), ("好", "1")]
            .iter()
            .enumerate()
            .map(|(i, (text, label))| {
                Example::Seq(SeqExample {
                    guid: format!("dev-{i}"),
                    text_a: text.to_string(),
                    text_b: None,
                    label: label.to_string(),
                })
            })
            .collect();
        let loaded = TaskExamples {
            task: TaskName::Tnews,
            examples,
        };
        let data = TaskData::encode(loaded, "dev", &tok, None).unwrap();
        let model = tiny_model(tok.vocab_size(), &[(TaskName::Tnews, data.label_list.len())]);
        let template = RephraseTemplate::new(&tok, 1, 16, true).unwrap();

        let outcome = Evaluator::new(&model, &tok, &template, 2).evaluate(&data).unwrap();
        let EvalMetrics::Seq(report) = &outcome.metrics else {
            panic!("expected classification metrics");
        };
        assert_eq!(report.examples, 3);
        assert!((0.0..=1.0).contains(&report.accuracy));
        assert!(outcome.eval_loss.is_finite() && outcome.eval_loss > 0.0);
    }

    #[test]
    fn test_evaluate_correction_set_scores_full_sentences() {
        let tok = tokenizer();
        let examples = [("我今天很高心", "我今天很高兴"), ("今天很好", "今天很好"), ("天", "天")]
            .iter()
            .enumerate()
            .map(|(i, (src, trg))| Example::Csc(CscExample::new(format!("test-{i}"), src, trg).unwrap()))
            .collect();
        let loaded = TaskExamples {
            task: TaskName::Ecspell,
            examples,
        };
        let data = TaskData::encode(loaded, "test", &tok, None).unwrap();
        let model = tiny_model(tok.vocab_size(), &[]);
        // room for four source characters, so the first sentence is cut
        let template = RephraseTemplate::new(&tok, 1, 12, true).unwrap();
        assert_eq!(template.max_sentence_len(), 4);

        let outcome = Evaluator::new(&model, &tok, &template, 2).evaluate(&data).unwrap();
        let EvalMetrics::Csc(report) = &outcome.metrics else {
            panic!("expected correction metrics");
        };
        assert_eq!(report.counts.sentences, 3);
        assert!(outcome.eval_loss.is_finite());

        let tmp = tempfile::TempDir::new().unwrap();
        outcome.write(tmp.path(), 10).unwrap();
        for file in ["sents.tp", "sents.fp", "sents.fn", "sents.wp", EVAL_RESULTS_FILE] {
            assert!(tmp.path().join(file).is_file(), "missing {file}");
        }
    }
}
