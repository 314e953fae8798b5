//! Keyword representation of clusters by class-based TF-IDF.
//!
//! Every cluster's member texts are concatenated into one "class document".
//! A term scores high for a class when it is frequent inside the class and
//! rare across all classes. The ordered top terms are the cluster's
//! representation, which doubles as its identity signature across runs, so
//! the ordering here must be fully deterministic (ties break alphabetically).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

pub const TOP_KEYWORDS: usize = 10;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between", "both",
    "but", "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "et",
    "etc", "few", "for", "from", "further", "had", "has", "have", "having", "he", "her", "here",
    "hers", "him", "his", "how", "however", "i", "if", "in", "into", "is", "it", "its", "itself",
    "may", "me", "might", "more", "most", "must", "my", "no", "nor", "not", "of", "off", "on",
    "once", "only", "or", "other", "our", "ours", "out", "over", "own", "per", "same", "shall",
    "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "then", "there", "these", "they", "this", "those", "through", "thus", "to", "too", "under",
    "until", "up", "upon", "us", "very", "via", "was", "we", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "within", "without", "would", "you",
    "your", "yours",
];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Words of 2+ characters starting with a letter.
    PATTERN.get_or_init(|| Regex::new(r"\b\p{L}[\p{L}\p{N}_-]+\b").expect("valid token regex"))
}

fn stop_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

/// Lowercased tokens with stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    token_pattern()
        .find_iter(&lowered)
        .map(|m| m.as_str().trim_matches(|c| c == '-' || c == '_').to_string())
        .filter(|t| t.chars().count() > 1 && !stop_words().contains(t.as_str()))
        .collect()
}

/// Top `top_n` keywords per class. `classes[i]` holds the texts of class `i`;
/// the result is aligned with it. An empty class gets no keywords.
pub fn class_keywords<S: AsRef<str>>(classes: &[Vec<S>], top_n: usize) -> Vec<Vec<String>> {
    let counts: Vec<BTreeMap<String, usize>> = classes
        .iter()
        .map(|texts| {
            let mut tf = BTreeMap::new();
            for text in texts {
                for token in tokenize(text.as_ref()) {
                    *tf.entry(token).or_insert(0) += 1;
                }
            }
            tf
        })
        .collect();

    let mut corpus_freq: HashMap<&str, usize> = HashMap::new();
    for tf in &counts {
        for (term, n) in tf {
            *corpus_freq.entry(term.as_str()).or_insert(0) += n;
        }
    }

    let class_sizes: Vec<usize> = counts.iter().map(|tf| tf.values().sum()).collect();
    let non_empty = class_sizes.iter().filter(|n| **n > 0).count().max(1);
    let avg_words = class_sizes.iter().sum::<usize>() as f64 / non_empty as f64;

    counts
        .iter()
        .zip(&class_sizes)
        .map(|(tf, &size)| {
            if size == 0 {
                return Vec::new();
            }
            let mut scored: Vec<(&str, f64)> = tf
                .iter()
                .map(|(term, &n)| {
                    let freq = (n as f64) / size as f64;
                    let idf = (1.0 + avg_words / corpus_freq[term.as_str()] as f64).ln();
                    (term.as_str(), freq * idf)
                })
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            scored
                .into_iter()
                .take(top_n)
                .map(|(term, _)| term.to_string())
                .collect()
        })
        .collect()
}
