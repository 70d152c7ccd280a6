//! Human-readable rendering of masked correction instances.

use serde::Serialize;

use relm_core::{CharTokenizer, CscExample, Feature, RephraseTemplate};

/// One masked instance as printed by `relm-preview-masks`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MaskPreview {
    pub guid: String,
    pub source: String,
    pub target: String,
    /// Unpadded model input, one token per element.
    pub input: Vec<String>,
    /// Source positions replaced by `[MASK]`.
    pub masked_source: Vec<usize>,
    /// `(position, label token)` for every labelled input position.
    pub labels: Vec<(usize, String)>,
}

impl MaskPreview {
    #[must_use]
    pub fn new(
        tokenizer: &CharTokenizer,
        template: &RephraseTemplate,
        example: &CscExample,
        feature: &Feature,
    ) -> Self {
        let token = |id: u32| tokenizer.id_to_token(id).unwrap_or("[UNK]").to_string();
        let used = feature.attention_mask.iter().filter(|&&m| m == 1).count();
        let source_start = template.source_start();
        let source_end = source_start + feature.source_len;
        let positions = feature.masked_positions();
        let masked_source = positions
            .iter()
            .filter(|&&p| p >= source_start && p < source_end)
            .map(|&p| p - source_start)
            .collect();
        let labels = positions
            .into_iter()
            .zip(feature.compact_labels())
            .map(|(p, id)| (p, token(id)))
            .collect();
        Self {
            guid: example.guid.clone(),
            source: example.source.iter().collect(),
            target: example.target.iter().collect(),
            input: feature.input_ids[..used].iter().map(|&id| token(id)).collect(),
            masked_source,
            labels,
        }
    }
}
