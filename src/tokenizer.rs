//! Token counting used by the chunker.
//!
//! Chunk boundaries are only stable for a fixed tokenizer, so the chunker
//! takes any [`Tokenizer`] and the default is a pure, dependency-free word
//! tokenizer.

use std::ops::Range;

/// Splits text into tokens and reports their byte spans.
pub trait Tokenizer: Send + Sync {
    /// Byte ranges of each token in `text`, in order.
    fn spans(&self, text: &str) -> Vec<Range<usize>>;

    fn count(&self, text: &str) -> usize {
        self.spans(text).len()
    }

    fn name(&self) -> &str;
}

/// Word-level estimate: every run of alphanumerics (plus `_`) is one token
/// and every other non-whitespace character is its own token.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn spans(&self, text: &str) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        let mut word_start: Option<usize> = None;

        for (i, c) in text.char_indices() {
            if c.is_alphanumeric() || c == '_' {
                if word_start.is_none() {
                    word_start = Some(i);
                }
                continue;
            }
            if let Some(start) = word_start.take() {
                spans.push(start..i);
            }
            if !c.is_whitespace() {
                spans.push(i..i + c.len_utf8());
            }
        }
        if let Some(start) = word_start {
            spans.push(start..text.len());
        }
        spans
    }

    fn name(&self) -> &str {
        "word"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_and_punctuation() {
        let t = WordTokenizer;
        assert_eq!(t.count("Hello, world!"), 4);
        assert_eq!(t.count(""), 0);
        assert_eq!(t.count("   \n\n  "), 0);
        assert_eq!(t.count("snake_case x2"), 2);
    }

    #[test]
    fn spans_index_into_source() {
        let t = WordTokenizer;
        let text = "naïve café: ok";
        let tokens: Vec<&str> = t.spans(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(tokens, vec!["naïve", "café", ":", "ok"]);
    }

    #[test]
    fn count_is_additive_over_whitespace_joins() {
        let t = WordTokenizer;
        let a = "First paragraph here.";
        let b = "Second one.";
        assert_eq!(t.count(&format!("{}\n\n{}", a, b)), t.count(a) + t.count(b));
    }
}
