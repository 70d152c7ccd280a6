//! # Rephrasing Template
//!
//! Turns encoded examples into fixed-length model features. A correction
//! example becomes
//!
//! ```text
//! [CLS] p_1..p_L  source  p_L+1..p_2L  [MASK] x n  [SEP]  [PAD]..
//! ```
//!
//! and the model is trained to write the whole corrected sentence into the
//! `n` trailing slots. Classification examples become
//! `[CLS] p_1..p_L text_a [SEP] (text_b [SEP])`.

use oorandom::Rand32;
use serde::Serialize;

use crate::error::{RelmError, Result};
use crate::masking::MaskingPolicy;
use crate::tokenizer::{CharTokenizer, SpecialTokens};
use crate::types::{CscExample, SeqExample, TaskName};

/// Label value for positions that do not contribute to the loss.
pub const IGNORE_INDEX: i64 = -100;

/// A correction example after tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCsc {
    pub source: Vec<u32>,
    pub target: Vec<u32>,
}

/// A classification example after tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSeq {
    pub text_a: Vec<u32>,
    pub text_b: Option<Vec<u32>>,
    pub label: u32,
}

/// Tokenized example ready for feature construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Csc(EncodedCsc),
    Seq(EncodedSeq),
}

impl EncodedCsc {
    pub fn new(example: &CscExample, tokenizer: &CharTokenizer) -> Self {
        Self {
            source: tokenizer.encode_chars(&example.source),
            target: tokenizer.encode_chars(&example.target),
        }
    }
}

impl EncodedSeq {
    /// Encode with `label_list` giving the class index of each label string.
    pub fn new(example: &SeqExample, tokenizer: &CharTokenizer, label_list: &[String]) -> Result<Self> {
        let label = label_list
            .iter()
            .position(|l| *l == example.label)
            .ok_or_else(|| {
                RelmError::InvalidConfig(format!(
                    "label {:?} of {} is not in the label list",
                    example.label, example.guid
                ))
            })?;
        Ok(Self {
            text_a: tokenizer.encode_text(&example.text_a),
            text_b: example.text_b.as_deref().map(|t| tokenizer.encode_text(t)),
            label: label as u32,
        })
    }
}

/// One padded model input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    pub task: TaskName,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    /// Per-position target id, [`IGNORE_INDEX`] where no loss applies.
    pub labels: Vec<i64>,
    /// Class index for classification features.
    pub class_label: Option<u32>,
    /// Index of the first target slot (correction features).
    pub slot_start: usize,
    /// Number of source characters kept after truncation.
    pub source_len: usize,
}

impl Feature {
    /// Positions that carry a label.
    #[must_use]
    pub fn masked_positions(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, &l)| (l != IGNORE_INDEX).then_some(i))
            .collect()
    }

    /// Labels of the masked positions, in position order.
    #[must_use]
    pub fn compact_labels(&self) -> Vec<u32> {
        self.labels
            .iter()
            .filter(|&&l| l != IGNORE_INDEX)
            .map(|&l| l as u32)
            .collect()
    }

    /// Slot positions, one per kept source character.
    pub fn slot_range(&self) -> std::ops::Range<usize> {
        self.slot_start..self.slot_start + self.source_len
    }
}

/// Layout parameters shared by every feature of a run.
#[derive(Debug, Clone)]
pub struct RephraseTemplate {
    special: SpecialTokens,
    /// Prompt ids before the source, then between source and slots.
    prompt_ids: Vec<u32>,
    prompt_length: usize,
    max_seq_length: usize,
}

impl RephraseTemplate {
    /// Build a template. With `apply_prompt` false, `[CLS]`/`[SEP]` stand in
    /// for the learned prompt tokens.
    pub fn new(
        tokenizer: &CharTokenizer,
        prompt_length: usize,
        max_seq_length: usize,
        apply_prompt: bool,
    ) -> Result<Self> {
        if max_seq_length < 2 * prompt_length + 4 {
            return Err(RelmError::InvalidConfig(format!(
                "max_seq_length {max_seq_length} cannot hold 2 x {prompt_length} prompt tokens and a sentence"
            )));
        }
        let special = tokenizer.special();
        let prompt_ids = if apply_prompt {
            tokenizer.prompt_ids(2 * prompt_length)?
        } else {
            std::iter::repeat_n(special.cls, prompt_length)
                .chain(std::iter::repeat_n(special.sep, prompt_length))
                .collect()
        };
        Ok(Self {
            special,
            prompt_ids,
            prompt_length,
            max_seq_length,
        })
    }

    #[must_use]
    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    #[must_use]
    pub fn prompt_length(&self) -> usize {
        self.prompt_length
    }

    /// Index of the first source token in a correction feature.
    #[must_use]
    pub fn source_start(&self) -> usize {
        1 + self.prompt_length
    }

    /// Ids that act as learned prompts (empty without prompts).
    #[must_use]
    pub fn learned_prompt_ids(&self) -> Vec<u32> {
        self.prompt_ids
            .iter()
            .copied()
            .filter(|&id| id != self.special.cls && id != self.special.sep)
            .collect()
    }

    /// Longest source a correction feature can carry.
    #[must_use]
    pub fn max_sentence_len(&self) -> usize {
        (self.max_seq_length - 2 - 2 * self.prompt_length) / 2
    }

    /// Build a correction feature. With a policy, source positions are
    /// masked first and labelled with their target character.
    pub fn csc_feature(
        &self,
        example: &EncodedCsc,
        policy: Option<&MaskingPolicy>,
        rng: &mut Rand32,
    ) -> Result<Feature> {
        let n = example.source.len().min(self.max_sentence_len());
        let source = &example.source[..n];
        let target = &example.target[..n.min(example.target.len())];
        if source.len() != target.len() {
            return Err(RelmError::LengthMismatch {
                source_len: source.len(),
                target_len: target.len(),
            });
        }

        let (source_ids, source_labels) = match policy {
            Some(policy) => {
                let instance = policy.apply(source, target, self.special.mask, rng)?;
                let mut labels = vec![IGNORE_INDEX; n];
                for (&pos, &label) in instance.positions.iter().zip(&instance.labels) {
                    labels[pos] = i64::from(label);
                }
                (instance.input_ids, labels)
            }
            None => (source.to_vec(), vec![IGNORE_INDEX; n]),
        };

        let (head, middle) = self.prompt_ids.split_at(self.prompt_length);
        let mut input_ids = Vec::with_capacity(self.max_seq_length);
        let mut labels = Vec::with_capacity(self.max_seq_length);

        input_ids.push(self.special.cls);
        input_ids.extend_from_slice(head);
        input_ids.extend_from_slice(&source_ids);
        input_ids.extend_from_slice(middle);
        labels.resize(1 + self.prompt_length, IGNORE_INDEX);
        labels.extend(source_labels);
        labels.resize(input_ids.len(), IGNORE_INDEX);

        let slot_start = input_ids.len();
        input_ids.extend(std::iter::repeat_n(self.special.mask, n));
        labels.extend(target.iter().map(|&t| i64::from(t)));
        input_ids.push(self.special.sep);
        labels.push(IGNORE_INDEX);

        let token_type_ids = vec![0; input_ids.len()];
        Ok(self.pad(Feature {
            task: TaskName::Sighan,
            input_ids,
            attention_mask: Vec::new(),
            token_type_ids,
            labels,
            class_label: None,
            slot_start,
            source_len: n,
        }))
    }

    /// Build a classification feature.
    pub fn seq_feature(&self, task: TaskName, example: &EncodedSeq) -> Feature {
        let budget = self.max_seq_length - 1 - self.prompt_length;
        let (len_a, len_b) = match &example.text_b {
            Some(b) => truncate_pair(example.text_a.len(), b.len(), budget.saturating_sub(2)),
            None => (example.text_a.len().min(budget - 1), 0),
        };

        let mut input_ids = vec![self.special.cls];
        input_ids.extend_from_slice(&self.prompt_ids[..self.prompt_length]);
        input_ids.extend_from_slice(&example.text_a[..len_a]);
        input_ids.push(self.special.sep);
        let mut token_type_ids = vec![0; input_ids.len()];
        if let Some(b) = &example.text_b {
            input_ids.extend_from_slice(&b[..len_b]);
            input_ids.push(self.special.sep);
            token_type_ids.resize(input_ids.len(), 1);
        }

        let labels = vec![IGNORE_INDEX; input_ids.len()];
        self.pad(Feature {
            task,
            input_ids,
            attention_mask: Vec::new(),
            token_type_ids,
            labels,
            class_label: Some(example.label),
            slot_start: 0,
            source_len: 0,
        })
    }

    /// Feature for any encoded example of `task`.
    pub fn feature(
        &self,
        task: TaskName,
        example: &Encoded,
        policy: Option<&MaskingPolicy>,
        rng: &mut Rand32,
    ) -> Result<Feature> {
        match example {
            Encoded::Csc(csc) => {
                let mut feature = self.csc_feature(csc, policy, rng)?;
                feature.task = task;
                Ok(feature)
            }
            Encoded::Seq(seq) => Ok(self.seq_feature(task, seq)),
        }
    }

    fn pad(&self, mut feature: Feature) -> Feature {
        let len = feature.input_ids.len();
        feature.attention_mask = vec![1; len];
        feature.input_ids.resize(self.max_seq_length, self.special.pad);
        feature.attention_mask.resize(self.max_seq_length, 0);
        feature.token_type_ids.resize(self.max_seq_length, 0);
        feature.labels.resize(self.max_seq_length, IGNORE_INDEX);
        feature
    }
}

/// Trim the longer side first until the pair fits `budget`.
fn truncate_pair(mut a: usize, mut b: usize, budget: usize) -> (usize, usize) {
    while a + b > budget {
        if a >= b {
            a -= 1;
        } else {
            b -= 1;
        }
    }
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::MaskMode;
    use crate::tokenizer::tests::test_tokenizer;

    fn example(tok: &CharTokenizer, src: &str, trg: &str) -> EncodedCsc {
        EncodedCsc::new(&CscExample::new("t", src, trg).unwrap(), tok)
    }

    #[test]
    fn test_layout_without_masking() {
        let tok = test_tokenizer();
        let template = RephraseTemplate::new(&tok, 2, 32, true).unwrap();
        let ex = example(&tok, "我今天很高心", "我今天很高兴");
        let feature = template.csc_feature(&ex, None, &mut Rand32::new(1)).unwrap();

        let special = tok.special();
        let prompts = tok.prompt_ids(4).unwrap();
        assert_eq!(feature.input_ids.len(), 32);
        assert_eq!(feature.input_ids[0], special.cls);
        assert_eq!(&feature.input_ids[1..3], &prompts[..2]);
        assert_eq!(template.source_start(), 3);
        assert_eq!(&feature.input_ids[3..9], ex.source.as_slice());
        assert_eq!(&feature.input_ids[9..11], &prompts[2..]);
        assert_eq!(feature.slot_start, 11);
        assert!(feature.input_ids[11..17].iter().all(|&id| id == special.mask));
        assert_eq!(feature.input_ids[17], special.sep);
        assert_eq!(feature.input_ids[18], special.pad);
        assert_eq!(feature.attention_mask.iter().sum::<u32>(), 18);

        assert_eq!(feature.masked_positions(), (11..17).collect::<Vec<_>>());
        assert_eq!(feature.compact_labels(), ex.target);
    }

    #[test]
    fn test_compact_labels_match_mask_count() {
        let tok = test_tokenizer();
        let template = RephraseTemplate::new(&tok, 3, 48, true).unwrap();
        let ex = example(&tok, "他们在学校读书的地得", "他们在学校读书得地的");
        let policy = MaskingPolicy::minimum_force(MaskMode::NoError, 0.3).unwrap();
        let mut rng = Rand32::new(7);
        for _ in 0..50 {
            let feature = template.csc_feature(&ex, Some(&policy), &mut rng).unwrap();
            let masks = feature
                .input_ids
                .iter()
                .filter(|&&id| id == tok.special().mask)
                .count();
            assert_eq!(feature.compact_labels().len(), masks);
            // errors at source positions 7 and 9 are always masked
            let offset = 1 + 3;
            assert_eq!(feature.input_ids[offset + 7], tok.special().mask);
            assert_eq!(feature.input_ids[offset + 9], tok.special().mask);
            assert_eq!(feature.labels[offset + 7], i64::from(ex.target[7]));
        }
    }

    #[test]
    fn test_not_apply_prompt_uses_placeholders() {
        let tok = test_tokenizer();
        let template = RephraseTemplate::new(&tok, 2, 24, false).unwrap();
        assert!(template.learned_prompt_ids().is_empty());
        let ex = example(&tok, "我好", "我好");
        let feature = template.csc_feature(&ex, None, &mut Rand32::new(1)).unwrap();
        let special = tok.special();
        assert_eq!(&feature.input_ids[..3], &[special.cls, special.cls, special.cls]);
        assert_eq!(&feature.input_ids[5..7], &[special.sep, special.sep]);
    }

    #[test]
    fn test_truncates_long_sentences() {
        let tok = test_tokenizer();
        let template = RephraseTemplate::new(&tok, 1, 16, true).unwrap();
        assert_eq!(template.max_sentence_len(), 6);
        let ex = example(&tok, "他们在学校读书的地得", "他们在学校读书的地得");
        let feature = template.csc_feature(&ex, None, &mut Rand32::new(1)).unwrap();
        assert_eq!(feature.source_len, 6);
        assert_eq!(feature.input_ids.len(), 16);
        assert_eq!(feature.attention_mask.iter().sum::<u32>(), 16);
    }

    #[test]
    fn test_prompt_too_long() {
        let tok = test_tokenizer();
        assert!(RephraseTemplate::new(&tok, 10, 20, false).is_err());
    }

    #[test]
    fn test_seq_pair_feature() {
        let tok = test_tokenizer();
        let template = RephraseTemplate::new(&tok, 1, 16, true).unwrap();
        let seq = EncodedSeq {
            text_a: tok.encode_text("他们好"),
            text_b: Some(tok.encode_text("我不好")),
            label: 1,
        };
        let feature = template.seq_feature(TaskName::Afqmc, &seq);
        assert_eq!(feature.class_label, Some(1));
        assert_eq!(feature.task, TaskName::Afqmc);
        // [CLS] p a a a [SEP] b b b [SEP]
        assert_eq!(feature.attention_mask.iter().sum::<u32>(), 10);
        assert_eq!(&feature.token_type_ids[..10], &[0, 0, 0, 0, 0, 0, 1, 1, 1, 1]);
        assert!(feature.compact_labels().is_empty());
    }

    #[test]
    fn test_truncate_pair() {
        assert_eq!(truncate_pair(10, 2, 8), (6, 2));
        assert_eq!(truncate_pair(3, 3, 4), (2, 2));
        assert_eq!(truncate_pair(1, 1, 4), (1, 1));
    }

    #[test]
    fn test_unknown_label() {
        let tok = test_tokenizer();
        let ex = SeqExample {
            guid: "x".into(),
            text_a: "我".into(),
            text_b: None,
            label: "108".into(),
        };
        assert!(EncodedSeq::new(&ex, &tok, &["100".to_string()]).is_err());
    }
}
