//! # Output Alignment
//!
//! Generated sentences are scored position by position, so they must have
//! exactly the source length. Slots that decode to several characters or to
//! none make the raw output longer or shorter; a Levenshtein alignment maps
//! it back.

use crate::tokenizer::CharTokenizer;

/// Edit operation chosen while backtracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Source position paired with a generated character.
    Pair,
    /// Source position with no generated counterpart.
    Delete,
    /// Generated character with no source counterpart.
    Insert,
}

/// Map `generated` onto the positions of `source`.
///
/// Paired positions take the generated character, source positions the
/// output skipped keep the source character, surplus generated characters
/// are dropped. The result always has `source.len()` characters.
#[must_use]
pub fn align_to_source(source: &[char], generated: &[char]) -> Vec<char> {
    if source.len() == generated.len() {
        return generated.to_vec();
    }
    if generated.is_empty() {
        return source.to_vec();
    }

    let (n, m) = (source.len(), generated.len());
    let width = m + 1;
    let mut dp = vec![0usize; (n + 1) * width];
    for i in 0..=n {
        dp[i * width] = i;
    }
    for j in 0..=m {
        dp[j] = j;
    }
    for i in 1..=n {
        for j in 1..=m {
            let sub = usize::from(source[i - 1] != generated[j - 1]);
            dp[i * width + j] = (dp[(i - 1) * width + j - 1] + sub)
                .min(dp[(i - 1) * width + j] + 1)
                .min(dp[i * width + j - 1] + 1);
        }
    }

    let mut aligned = source.to_vec();
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        let step = if i > 0 && j > 0 {
            let sub = usize::from(source[i - 1] != generated[j - 1]);
            let here = dp[i * width + j];
            if here == dp[(i - 1) * width + j - 1] + sub {
                Step::Pair
            } else if here == dp[(i - 1) * width + j] + 1 {
                Step::Delete
            } else {
                Step::Insert
            }
        } else if i > 0 {
            Step::Delete
        } else {
            Step::Insert
        };

        match step {
            Step::Pair => {
                aligned[i - 1] = generated[j - 1];
                i -= 1;
                j -= 1;
            }
            Step::Delete => i -= 1,
            Step::Insert => j -= 1,
        }
    }
    aligned
}

/// Characters produced by the slot predictions, before alignment.
///
/// Slots predicting a special or unknown token contribute the source
/// character at that slot.
#[must_use]
pub fn slot_chars(tokenizer: &CharTokenizer, source: &[char], slot_ids: &[u32]) -> Vec<char> {
    let mut out = Vec::with_capacity(slot_ids.len());
    for (i, &id) in slot_ids.iter().enumerate() {
        match tokenizer.token_chars(id) {
            Some(chars) => out.extend(chars),
            None => {
                if let Some(&c) = source.get(i) {
                    out.push(c);
                }
            }
        }
    }
    out
}

/// Decode slot predictions and align them to the source.
#[must_use]
pub fn reconstruct(tokenizer: &CharTokenizer, source: &[char], slot_ids: &[u32]) -> Vec<char> {
    align_to_source(source, &slot_chars(tokenizer, source, slot_ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::test_tokenizer;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_equal_length_is_positional() {
        let out = align_to_source(&chars("我今天很高心"), &chars("我今天很高兴"));
        assert_eq!(out, chars("我今天很高兴"));
    }

    #[test]
    fn test_insertion_is_dropped() {
        let out = align_to_source(&chars("我今天很高心"), &chars("我今天真很高兴"));
        assert_eq!(out.len(), 6);
        assert_eq!(out, chars("我今天很高兴"));
    }

    #[test]
    fn test_deletion_keeps_source_char() {
        let out = align_to_source(&chars("我今天很高心"), &chars("我今很高兴"));
        assert_eq!(out, chars("我今天很高兴"));
    }

    #[test]
    fn test_empty_and_degenerate_inputs() {
        assert_eq!(align_to_source(&chars("我好"), &[]), chars("我好"));
        assert!(align_to_source(&[], &chars("我好")).is_empty());
        let out = align_to_source(&chars("abc"), &chars("xyzxyzxyz"));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_any_length_yields_source_length() {
        let source = chars("他们在学校读书");
        for len in 0..20 {
            let generated: Vec<char> = "好坏的".chars().cycle().take(len).collect();
            assert_eq!(align_to_source(&source, &generated).len(), source.len());
        }
    }

    #[test]
    fn test_reconstruct_special_and_wordpiece() {
        let tok = test_tokenizer();
        let source = chars("读书");
        let slots = vec![tok.special().unk, tok.token_to_id("##书").unwrap()];
        assert_eq!(reconstruct(&tok, &source, &slots), chars("读书"));

        let ab = tok.token_to_id("ab").unwrap();
        let out = reconstruct(&tok, &chars("他们"), &[ab, tok.char_to_id('们')]);
        assert_eq!(out.len(), 2);
    }
}
