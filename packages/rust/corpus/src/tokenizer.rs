//! Text analysis shared by indexing and querying.
//!
//! NFKC normalization, lowercasing, Unicode word splitting, English
//! stopword removal, and Snowball stemming. Documents and queries must go
//! through the same pipeline or term lookups will miss.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use unicode_normalization::UnicodeNormalization;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?u)\p{L}[\p{L}\p{N}_']*|\p{N}+").expect("valid regex"));

static STEMMER: LazyLock<Stemmer> = LazyLock::new(|| Stemmer::create(Algorithm::English));

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any",
        "are", "as", "at", "be", "because", "been", "before", "being", "below", "between",
        "both", "but", "by", "can", "cannot", "could", "did", "do", "does", "doing", "down",
        "during", "each", "few", "for", "from", "further", "had", "has", "have", "having", "he",
        "her", "here", "hers", "herself", "him", "himself", "his", "how", "i", "if", "in",
        "into", "is", "it", "it's", "its", "itself", "me", "more", "most", "my", "myself", "no",
        "nor", "not", "of", "off", "on", "once", "only", "or", "other", "ought", "our", "ours",
        "ourselves", "out", "over", "own", "same", "she", "should", "so", "some", "such",
        "than", "that", "the", "their", "theirs", "them", "themselves", "then", "there",
        "these", "they", "this", "those", "through", "to", "too", "under", "until", "up",
        "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
        "why", "with", "would", "you", "your", "yours", "yourself", "yourselves",
    ]
    .into_iter()
    .collect()
});

/// Split `text` into index terms, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = text.nfkc().collect::<String>().to_lowercase();
    WORD_RE
        .find_iter(&normalized)
        .map(|m| m.as_str())
        .filter(|token| !STOPWORDS.contains(token))
        .map(|token| STEMMER.stem(token).into_owned())
        .collect()
}

/// Distinct terms of `text` in first-occurrence order.
pub fn unique_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_and_drops_stopwords() {
        let t = tokenize("The Running of the runners!");
        assert_eq!(t, vec!["run", "runner"]);
    }

    #[test]
    fn keeps_numbers_as_terms() {
        let t = tokenize("Alma 32:21");
        assert_eq!(t, vec!["alma", "32", "21"]);
    }

    #[test]
    fn normalizes_compatibility_forms() {
        // Full-width letters fold to ASCII under NFKC.
        assert_eq!(tokenize("ＦＡＩＴＨ"), tokenize("faith"));
    }

    #[test]
    fn unique_terms_keep_first_occurrence() {
        assert_eq!(unique_terms("faith hope faith"), vec!["faith", "hope"]);
    }
}
