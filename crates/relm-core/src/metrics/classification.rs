//! Accuracy and macro-F1 for the auxiliary classification tasks.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{RelmError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub accuracy: f64,
    pub macro_f1: f64,
    pub examples: usize,
}

/// Score class predictions against gold labels.
pub fn classification_compute(predictions: &[u32], labels: &[u32]) -> Result<ClassificationReport> {
    if predictions.len() != labels.len() {
        return Err(RelmError::Metrics(format!(
            "{} predictions for {} labels",
            predictions.len(),
            labels.len()
        )));
    }
    if labels.is_empty() {
        return Ok(ClassificationReport::default());
    }

    let correct = predictions.iter().zip(labels).filter(|(p, l)| p == l).count();
    let classes: BTreeSet<u32> = predictions.iter().chain(labels).copied().collect();

    let mut f1_sum = 0.0;
    for &class in &classes {
        let tp = predictions
            .iter()
            .zip(labels)
            .filter(|&(&p, &l)| p == class && l == class)
            .count();
        let predicted = predictions.iter().filter(|&&p| p == class).count();
        let gold = labels.iter().filter(|&&l| l == class).count();
        f1_sum += super::csc::Prf::from_counts(tp, predicted, gold).f1;
    }

    Ok(ClassificationReport {
        accuracy: correct as f64 / labels.len() as f64,
        macro_f1: f1_sum / classes.len() as f64,
        examples: labels.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect() {
        let report = classification_compute(&[0, 1, 2], &[0, 1, 2]).unwrap();
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.macro_f1, 1.0);
    }

    #[test]
    fn test_macro_average() {
        // class 0: p=1/2 r=1 f1=2/3; class 1: p=1 r=2/3 f1=4/5
        let report = classification_compute(&[0, 0, 1, 1], &[0, 1, 1, 1]).unwrap();
        assert_eq!(report.accuracy, 0.75);
        assert!((report.macro_f1 - 0.7333).abs() < 1e-3);
    }

    #[test]
    fn test_mismatch_and_empty() {
        assert!(classification_compute(&[0], &[]).is_err());
        assert_eq!(classification_compute(&[], &[]).unwrap().examples, 0);
    }
}
