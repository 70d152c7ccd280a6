//! # Character Tokenizer
//!
//! Maps Chinese sentences to BERT vocabulary ids one character at a time so
//! that token positions and character positions coincide.
//! The vocabulary comes from a HuggingFace `tokenizer.json` or a `vocab.txt`.

use std::collections::HashMap;
use std::path::Path;

use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{RelmError, Result};

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const MASK_TOKEN: &str = "[MASK]";

/// Ids of the special tokens used by the rephrasing template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub unk: u32,
    pub cls: u32,
    pub sep: u32,
    pub mask: u32,
}

/// Character-level view over a BERT vocabulary.
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    token_to_id: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
    special: SpecialTokens,
    lowercase: bool,
}

impl CharTokenizer {
    /// Build from a token → id map. All five special tokens must be present.
    pub fn from_vocab(token_to_id: HashMap<String, u32>) -> Result<Self> {
        let lookup = |token: &str| {
            token_to_id
                .get(token)
                .copied()
                .ok_or_else(|| RelmError::Vocabulary(format!("missing special token {token}")))
        };
        let special = SpecialTokens {
            pad: lookup(PAD_TOKEN)?,
            unk: lookup(UNK_TOKEN)?,
            cls: lookup(CLS_TOKEN)?,
            sep: lookup(SEP_TOKEN)?,
            mask: lookup(MASK_TOKEN)?,
        };
        let id_to_token = token_to_id
            .iter()
            .map(|(token, &id)| (id, token.clone()))
            .collect();

        Ok(Self {
            token_to_id,
            id_to_token,
            special,
            lowercase: false,
        })
    }

    /// Build from an ordered token list; the id of a token is its index.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = tokens
            .into_iter()
            .enumerate()
            .map(|(i, t)| (t.into(), i as u32))
            .collect();
        Self::from_vocab(map)
    }

    /// Load a HuggingFace `tokenizer.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let hf = HfTokenizer::from_file(path)
            .map_err(|e| RelmError::Vocabulary(format!("{}: {e}", path.display())))?;
        Self::from_vocab(hf.get_vocab(true))
    }

    /// Load a BERT `vocab.txt` (one token per line, id = line index).
    pub fn from_vocab_txt<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_tokens(content.lines().map(str::trim_end))
    }

    /// Load whatever vocabulary a model directory ships, preferring `tokenizer.json`.
    pub fn from_model_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let json = dir.join("tokenizer.json");
        let txt = dir.join("vocab.txt");
        let tokenizer = if json.exists() {
            Self::from_file(&json)?
        } else if txt.exists() {
            Self::from_vocab_txt(&txt)?
        } else {
            return Err(RelmError::MissingFile(json));
        };
        debug!(dir = %dir.display(), vocab = tokenizer.vocab_size(), "vocabulary loaded");
        Ok(tokenizer)
    }

    /// Lowercase characters before lookup (`--do_lower_case`).
    #[must_use]
    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    #[must_use]
    pub fn special(&self) -> SpecialTokens {
        self.special
    }

    /// Size of the id space (largest id + 1).
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.id_to_token.keys().max().map_or(0, |&max| max as usize + 1)
    }

    /// Id of a single character, `[UNK]` when it is not in the vocabulary.
    #[must_use]
    pub fn char_to_id(&self, c: char) -> u32 {
        let mut buf = [0u8; 4];
        let key: &str = c.encode_utf8(&mut buf);
        if let Some(&id) = self.token_to_id.get(key) {
            return id;
        }
        if self.lowercase {
            let lower: String = c.to_lowercase().collect();
            if let Some(&id) = self.token_to_id.get(&lower) {
                return id;
            }
        }
        self.special.unk
    }

    #[must_use]
    pub fn encode_chars(&self, chars: &[char]) -> Vec<u32> {
        chars.iter().map(|&c| self.char_to_id(c)).collect()
    }

    /// Encode a raw sentence, skipping whitespace.
    #[must_use]
    pub fn encode_text(&self, text: &str) -> Vec<u32> {
        text.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| self.char_to_id(c))
            .collect()
    }

    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    #[must_use]
    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    /// Bracketed tokens such as `[CLS]` or `[unused3]`.
    #[must_use]
    pub fn is_special(&self, id: u32) -> bool {
        self.id_to_token(id)
            .is_some_and(|t| t.len() > 2 && t.starts_with('[') && t.ends_with(']'))
    }

    /// Characters a predicted id stands for.
    ///
    /// Returns `None` for special and unknown tokens, which the evaluator
    /// replaces by the source character. Word-piece `##` prefixes are dropped.
    #[must_use]
    pub fn token_chars(&self, id: u32) -> Option<Vec<char>> {
        if id == self.special.unk || self.is_special(id) {
            return None;
        }
        let token = self.id_to_token(id)?;
        let piece = token.strip_prefix("##").unwrap_or(token);
        if piece.is_empty() {
            return None;
        }
        Some(piece.chars().collect())
    }

    /// Ids of `[unused1]` … `[unused{count}]`, the learnable prompt tokens.
    pub fn prompt_ids(&self, count: usize) -> Result<Vec<u32>> {
        (1..=count)
            .map(|i| {
                let token = format!("[unused{i}]");
                self.token_to_id(&token).ok_or_else(|| {
                    RelmError::Vocabulary(format!(
                        "vocabulary has no {token}; lower --prompt_length or pass --not_apply_prompt"
                    ))
                })
            })
            .collect()
    }
}
