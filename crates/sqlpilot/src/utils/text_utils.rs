//! Text helpers shared by the scorer, the policy engine and the service layer

use std::borrow::Cow;
use std::collections::HashSet;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Check if text contains pattern (case-insensitive)
    pub fn contains_ignore_case(text: &str, pattern: &str) -> bool {
        if pattern.len() > text.len() {
            return false;
        }
        text.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Collapse runs of whitespace into single spaces and trim
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Truncate to at most `max_chars` characters, never splitting a code point
    pub fn truncate_chars(text: &str, max_chars: usize) -> Cow<'_, str> {
        match text.char_indices().nth(max_chars) {
            Some((idx, _)) => Cow::Borrowed(&text[..idx]),
            None => Cow::Borrowed(text),
        }
    }

    /// Truncate text to max length with ellipsis if needed
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result = String::with_capacity(max_chars);
            result.push_str(&Self::truncate_chars(text, max_chars - 3));
            result.push_str("...");
            Cow::Owned(result)
        }
    }

    /// Lowercased whitespace-separated words
    pub fn word_set(text: &str) -> HashSet<String> {
        text.split_whitespace().map(|w| w.to_lowercase()).collect()
    }

    /// Jaccard similarity of the word sets of two texts
    pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
        let left = Self::word_set(a);
        let right = Self::word_set(b);
        if left.is_empty() || right.is_empty() {
            return 0.0;
        }
        let intersection = left.intersection(&right).count();
        let union = left.union(&right).count();
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(TextUtils::normalize_whitespace("SELECT  a\n\tFROM   t "), "SELECT a FROM t");
        assert_eq!(TextUtils::normalize_whitespace("plain"), "plain");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(TextUtils::truncate_with_ellipsis("short", 10), "short");
        assert_eq!(TextUtils::truncate_with_ellipsis("a longer sentence", 8), "a lon...");
        assert_eq!(TextUtils::truncate_with_ellipsis("héllo wörld", 6), "hél...");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(TextUtils::truncate_chars("ünïcode", 3), "ünï");
        assert_eq!(TextUtils::truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_jaccard_similarity() {
        assert_eq!(TextUtils::jaccard_similarity("show revenue", "show revenue"), 1.0);
        assert_eq!(TextUtils::jaccard_similarity("a b", "c d"), 0.0);
        assert!((TextUtils::jaccard_similarity("a b c", "a b d") - 0.5).abs() < 1e-9);
        assert_eq!(TextUtils::jaccard_similarity("", "x"), 0.0);
    }

    #[test]
    fn test_contains_ignore_case() {
        assert!(TextUtils::contains_ignore_case("Table NOT FOUND", "not found"));
        assert!(!TextUtils::contains_ignore_case("ok", "longer pattern"));
    }
}
