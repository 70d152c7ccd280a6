//! # Spelling Correction Metrics
//!
//! Sentence- and character-level detection and correction scores in the
//! SIGHAN style. All three inputs must already be aligned to the same
//! length per sentence (see [`super::align`]).

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{RelmError, Result};

/// Precision, recall and F1 as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Prf {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Prf {
    /// Scores from a true-positive count and the predicted / gold totals.
    /// An empty denominator scores zero.
    #[must_use]
    pub fn from_counts(true_positives: usize, predicted: usize, gold: usize) -> Self {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(true_positives, predicted);
        let recall = ratio(true_positives, gold);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
        }
    }
}

/// Detection and correction scores at one granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LevelScores {
    pub detection: Prf,
    pub correction: Prf,
}

/// Sentence tallies behind the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CscCounts {
    pub sentences: usize,
    /// Sentences containing at least one error.
    pub positives: usize,
    pub negatives: usize,
    /// Sentences the model changed.
    pub predicted_positives: usize,
}

/// Full evaluation result for a correction dataset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CscReport {
    pub sentence: LevelScores,
    pub character: LevelScores,
    /// Share of error-free sentences the model changed.
    pub false_positive_rate: f64,
    /// Share of erroneous sentences changed into something other than the target.
    pub wrong_correction_rate: f64,
    pub counts: CscCounts,
    /// Erroneous sentences fixed exactly, as `source -> target` differences.
    #[serde(skip)]
    pub true_positives: Vec<String>,
    /// Error-free sentences the model changed, as `target -> prediction`.
    #[serde(skip)]
    pub false_positives: Vec<String>,
    /// Erroneous sentences left untouched.
    #[serde(skip)]
    pub false_negatives: Vec<String>,
    /// Erroneous sentences changed to something other than the target.
    #[serde(skip)]
    pub wrong_predictions: Vec<String>,
}

impl CscReport {
    /// Write `sents.tp`, `sents.fp`, `sents.fn` and `sents.wp` into `dir`.
    pub fn write_sentence_files(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for (name, lines) in [
            ("sents.tp", &self.true_positives),
            ("sents.fp", &self.false_positives),
            ("sents.fn", &self.false_negatives),
            ("sents.wp", &self.wrong_predictions),
        ] {
            let mut content = lines.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            fs::write(dir.join(name), content)?;
        }
        Ok(())
    }
}

/// Render `from` with every differing position written as `(a->b)`.
#[must_use]
pub fn difference(from: &[char], to: &[char]) -> String {
    let mut out = String::with_capacity(from.len() * 3);
    for (i, &a) in from.iter().enumerate() {
        match to.get(i) {
            Some(&b) if b != a => {
                out.push('(');
                out.push(a);
                out.push_str("->");
                out.push(b);
                out.push(')');
            }
            _ => out.push(a),
        }
    }
    out
}

/// Score aligned predictions against gold targets.
pub fn csc_compute(
    sources: &[Vec<char>],
    targets: &[Vec<char>],
    predictions: &[Vec<char>],
) -> Result<CscReport> {
    if sources.len() != targets.len() || sources.len() != predictions.len() {
        return Err(RelmError::Metrics(format!(
            "got {} sources, {} targets and {} predictions",
            sources.len(),
            targets.len(),
            predictions.len()
        )));
    }

    let mut report = CscReport::default();
    let mut sent_detect_tp = 0usize;
    let mut char_predicted = 0usize;
    let mut char_gold = 0usize;
    let mut char_detect_tp = 0usize;
    let mut char_correct_tp = 0usize;

    for (idx, ((s, t), p)) in sources.iter().zip(targets).zip(predictions).enumerate() {
        if s.len() != t.len() || s.len() != p.len() {
            return Err(RelmError::Metrics(format!(
                "sentence {idx}: source/target/prediction lengths {}/{}/{}",
                s.len(),
                t.len(),
                p.len()
            )));
        }
        report.counts.sentences += 1;

        let mut same_positions = true;
        for ((sc, tc), pc) in s.iter().zip(t).zip(p) {
            let gold = sc != tc;
            let predicted = sc != pc;
            char_gold += usize::from(gold);
            char_predicted += usize::from(predicted);
            if gold && predicted {
                char_detect_tp += 1;
                char_correct_tp += usize::from(pc == tc);
            }
            same_positions &= gold == predicted;
        }

        let predicted_positive = s != p;
        report.counts.predicted_positives += usize::from(predicted_positive);

        if s != t {
            report.counts.positives += 1;
            if same_positions {
                sent_detect_tp += 1;
            }
            if p == t {
                report.true_positives.push(difference(s, t));
            } else if p == s {
                report.false_negatives.push(difference(s, t));
            } else {
                report.wrong_predictions.push(difference(s, t));
            }
        } else {
            report.counts.negatives += 1;
            if p != t {
                report.false_positives.push(difference(t, p));
            }
        }
    }

    let counts = report.counts;
    report.sentence = LevelScores {
        detection: Prf::from_counts(sent_detect_tp, counts.predicted_positives, counts.positives),
        correction: Prf::from_counts(
            report.true_positives.len(),
            counts.predicted_positives,
            counts.positives,
        ),
    };
    report.character = LevelScores {
        detection: Prf::from_counts(char_detect_tp, char_predicted, char_gold),
        correction: Prf::from_counts(char_correct_tp, char_predicted, char_gold),
    };
    report.false_positive_rate = if counts.negatives == 0 {
        0.0
    } else {
        report.false_positives.len() as f64 / counts.negatives as f64
    };
    report.wrong_correction_rate = if counts.positives == 0 {
        0.0
    } else {
        report.wrong_predictions.len() as f64 / counts.positives as f64
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    fn compute(rows: &[(&str, &str, &str)]) -> CscReport {
        let s: Vec<_> = rows.iter().map(|r| chars(r.0)).collect();
        let t: Vec<_> = rows.iter().map(|r| chars(r.1)).collect();
        let p: Vec<_> = rows.iter().map(|r| chars(r.2)).collect();
        csc_compute(&s, &t, &p).unwrap()
    }

    #[test]
    fn test_perfect_prediction() {
        let report = compute(&[("我今天很高心", "我今天很高兴", "我今天很高兴")]);
        assert_eq!(report.character.correction.f1, 1.0);
        assert_eq!(report.character.detection.f1, 1.0);
        assert_eq!(report.sentence.correction.f1, 1.0);
        assert_eq!(report.true_positives, vec!["我今天很高(心->兴)".to_string()]);
        assert_eq!(report.false_positive_rate, 0.0);
    }

    #[test]
    fn test_detected_but_wrongly_corrected() {
        let report = compute(&[("我今天很高心", "我今天很高兴", "我今天很高好")]);
        assert_eq!(report.sentence.detection.f1, 1.0);
        assert_eq!(report.sentence.correction.f1, 0.0);
        assert_eq!(report.character.detection.precision, 1.0);
        assert_eq!(report.character.correction.precision, 0.0);
        assert_eq!(report.wrong_predictions.len(), 1);
        assert_eq!(report.wrong_correction_rate, 1.0);
    }

    #[test]
    fn test_false_positive_and_negative() {
        let report = compute(&[
            ("他们在学校", "他们在学校", "他门在学校"),
            ("我今天很高心", "我今天很高兴", "我今天很高心"),
            ("读书好", "读书好", "读书好"),
        ]);
        assert_eq!(report.counts.negatives, 2);
        assert_eq!(report.counts.positives, 1);
        assert_eq!(report.counts.predicted_positives, 1);
        assert_eq!(report.false_positive_rate, 0.5);
        assert_eq!(report.false_positives, vec!["他(们->门)在学校".to_string()]);
        assert_eq!(report.false_negatives.len(), 1);
        assert_eq!(report.sentence.correction, Prf::from_counts(0, 1, 1));
    }

    #[test]
    fn test_partial_sentence_fix() {
        // two errors, one fixed
        let report = compute(&[("的地得", "得地的", "得地得")]);
        assert_eq!(report.character.correction.precision, 1.0);
        assert_eq!(report.character.correction.recall, 0.5);
        assert_eq!(report.sentence.detection.f1, 0.0);
        assert_eq!(report.sentence.correction.f1, 0.0);
    }

    #[test]
    fn test_length_checks() {
        let s = vec![chars("我好")];
        assert!(csc_compute(&s, &s, &[]).is_err());
        assert!(csc_compute(&s, &s, &[chars("我")]).is_err());
    }

    #[test]
    fn test_sentence_files() {
        let report = compute(&[
            ("我今天很高心", "我今天很高兴", "我今天很高兴"),
            ("他们在学校", "他们在学校", "他门在学校"),
        ]);
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("eval");
        report.write_sentence_files(&dir).unwrap();
        let tp = fs::read_to_string(dir.join("sents.tp")).unwrap();
        assert_eq!(tp, "我今天很高(心->兴)\n");
        assert_eq!(fs::read_to_string(dir.join("sents.fn")).unwrap(), "");
    }

    #[test]
    fn test_prf_zero_denominators() {
        assert_eq!(Prf::from_counts(0, 0, 0), Prf::default());
    }
}
