//! Word cleanup helpers for vocabulary extraction.

use crate::marker::Marker;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;

static RE_EDGE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{P}\s]+|[\p{P}\s]+$").expect("edge punctuation regex"));

/// Strip leading/trailing punctuation from a spoken word.
///
/// Hangul is composed to NFC first so decomposed jamo and precomposed
/// syllables collapse to the same vocabulary entry. Returns `None` when
/// nothing but punctuation was left.
pub fn clean_word(word: &str) -> Option<String> {
    let composed: String = word.nfc().collect();
    let cleaned = RE_EDGE_PUNCT.replace_all(&composed, "");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.into_owned())
    }
}

/// Distinct cleaned words of a marker sequence.
pub fn vocabulary_from_markers(markers: &[Marker]) -> BTreeSet<String> {
    markers
        .iter()
        .filter_map(|marker| clean_word(&marker.word))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_edge_punctuation_only() {
        assert_eq!(clean_word("안녕하세요,").as_deref(), Some("안녕하세요"));
        assert_eq!(clean_word("\"반갑습니다.\"").as_deref(), Some("반갑습니다"));
        assert_eq!(clean_word("e.g").as_deref(), Some("e.g"));
    }

    #[test]
    fn punctuation_only_words_are_dropped() {
        assert_eq!(clean_word("..."), None);
        assert_eq!(clean_word(""), None);
        assert_eq!(clean_word(" — "), None);
    }

    #[test]
    fn vocabulary_collapses_duplicates_and_strips_punctuation() {
        let markers = vec![
            Marker::new("안녕하세요,", 0, 0, 6),
            Marker::new("만나서", 701, 7, 10),
            Marker::new("반갑습니다.", 1137, 11, 17),
        ];
        let vocab = vocabulary_from_markers(&markers);
        assert_eq!(vocab.len(), 3);
        assert!(vocab.contains("안녕하세요"));
        assert!(vocab.contains("만나서"));
        assert!(vocab.contains("반갑습니다"));

        let repeated = vec![
            Marker::new("만나서", 0, 0, 3),
            Marker::new("만나서!", 500, 4, 8),
            Marker::new("?", 900, 9, 10),
        ];
        assert_eq!(
            vocabulary_from_markers(&repeated).into_iter().collect::<Vec<_>>(),
            vec!["만나서".to_string()]
        );
    }

    #[test]
    fn decomposed_hangul_matches_composed_form() {
        let decomposed: String = "한".nfd().collect();
        assert_ne!(decomposed, "한");
        assert_eq!(clean_word(&decomposed).as_deref(), Some("한"));
    }
}
