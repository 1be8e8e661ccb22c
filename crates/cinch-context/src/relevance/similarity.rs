//! Lexical term vectors and cosine similarity.
//!
//! Plain term frequency, normalized by the most frequent term in the
//! document. No IDF: the corpus changes every turn and the scorer only needs
//! a stable "talks about the same things" signal.

use std::collections::BTreeMap;

/// Term → normalized frequency. Ordered so that dot products sum in a fixed
/// order regardless of argument order.
pub type TermVector = BTreeMap<String, f64>;

/// Tokens this short carry no topical signal.
const MIN_TOKEN_CHARS: usize = 3;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "see", "two",
    "who", "did", "get", "let", "she", "too", "use", "that", "this", "with", "from", "they",
    "will", "would", "there", "their", "what", "about", "which", "when", "make", "like", "into",
    "than", "them", "then", "some", "could", "other", "these", "been", "were", "your", "just",
    "also", "should", "does", "each", "here", "only", "very",
];

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Lower-case words of `text`, with punctuation, short tokens and stop words
/// removed. Underscores count as word characters so identifiers survive.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| word.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_lowercase)
        .filter(|word| !is_stop_word(word))
}

/// Build the normalized term-frequency vector of `text`.
pub fn term_vector(text: &str) -> TermVector {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_default() += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    if max == 0 {
        return TermVector::new();
    }
    counts
        .into_iter()
        .map(|(term, count)| (term, count as f64 / max as f64))
        .collect()
}

fn norm_squared(v: &TermVector) -> f64 {
    v.values().map(|x| x * x).sum()
}

/// Cosine similarity in `[0, 1]`. Zero when either vector is empty.
///
/// ```
/// use cinch_context::relevance::similarity::{cosine_similarity, term_vector};
///
/// let a = term_vector("parse the config file");
/// let b = term_vector("config parser");
/// assert!(cosine_similarity(&a, &b) > 0.0);
/// assert_eq!(cosine_similarity(&a, &a), 1.0);
/// ```
pub fn cosine_similarity(a: &TermVector, b: &TermVector) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let denom = (norm_squared(a) * norm_squared(b)).sqrt();
    (dot / denom).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_noise() {
        let tokens: Vec<String> = tokenize("The Parser, in src/io.rs: it's fine!").collect();
        assert_eq!(tokens, vec!["parser", "src", "fine"]);
    }

    #[test]
    fn tokenize_keeps_identifiers() {
        let tokens: Vec<String> = tokenize("call load_file(uri)").collect();
        assert_eq!(tokens, vec!["call", "load_file", "uri"]);
    }

    #[test]
    fn term_vector_normalizes_by_max_frequency() {
        let v = term_vector("cache cache cache eviction");
        assert_eq!(v["cache"], 1.0);
        assert!((v["eviction"] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_vectors_have_zero_similarity() {
        let empty = term_vector("a an of");
        assert!(empty.is_empty());
        assert_eq!(cosine_similarity(&empty, &term_vector("banana")), 0.0);
        assert_eq!(cosine_similarity(&empty, &empty), 0.0);
    }

    #[test]
    fn cosine_is_symmetric() {
        let pairs = [
            ("apple banana cherry", "banana banana date"),
            ("token budget compression", "compress the token window budget budget"),
            ("read the loader cache", "cache ttl expiry"),
        ];
        for (x, y) in pairs {
            let (a, b) = (term_vector(x), term_vector(y));
            assert_eq!(
                cosine_similarity(&a, &b).to_bits(),
                cosine_similarity(&b, &a).to_bits()
            );
        }
    }

    #[test]
    fn self_similarity_is_one() {
        for text in [
            "banana",
            "apple banana",
            "relevance relevance scorer decay half life",
            "fn main() { println!(\"hello world\"); }",
        ] {
            let v = term_vector(text);
            assert_eq!(cosine_similarity(&v, &v), 1.0, "{text}");
        }
    }

    #[test]
    fn disjoint_texts_are_orthogonal() {
        assert_eq!(
            cosine_similarity(&term_vector("apple cherry"), &term_vector("date fig")),
            0.0
        );
    }
}
