//! Question keyword extraction

use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "show", "me", "get", "find", "list", "all", "the", "a", "an", "of", "in",
        "for", "with", "by", "from", "to", "and", "or", "what", "which", "is", "are",
    ]
    .into_iter()
    .collect();
}

/// Extracts the significant words of a natural-language question
#[derive(Debug, Clone)]
pub struct KeywordExtractor {
    min_word_length: usize,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self { min_word_length: 3 }
    }
}

impl KeywordExtractor {
    pub fn new(min_word_length: usize) -> Self {
        Self { min_word_length }
    }

    pub fn is_stop_word(word: &str) -> bool {
        STOP_WORDS.contains(word)
    }

    /// Lowercased words, punctuation stripped, stop words and short words removed.
    /// Order of first appearance is kept; duplicates are dropped.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(|w| w.to_lowercase())
            .filter(|w| w.chars().count() >= self.min_word_length && !Self::is_stop_word(w))
            .filter(|w| seen.insert(w.clone()))
            .collect()
    }
}
