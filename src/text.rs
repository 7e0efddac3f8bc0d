//! Text canonicalization for the keyword fallback and maintenance paths
//!
//! Provides:
//! - **Canonical tokens**: lowercase alphanumeric tokens, stopword and
//!   short-token removal, light suffix stemming, synonym expansion
//! - **Jaccard similarity** over canonical token sets
//! - **Keyword and extractive summaries** used by the decay worker

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

/// Stopwords dropped during canonicalization
static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "to", "of", "and", "or", "in", "on", "for", "with", "at", "by", "is",
        "it", "be", "as", "are", "was", "were", "from", "that", "this", "these", "those", "but",
        "if", "then", "so", "than", "into", "over", "under", "about", "via", "vs", "not",
    ]
    .into_iter()
    .collect()
});

/// Fixed synonym groups; every member maps to the whole group
static SYNONYMS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    const GROUPS: &[&[&str]] = &[
        &["prefer", "like", "love", "enjoy"],
        &["theme", "mode", "style"],
        &["task", "todo", "job"],
        &["user", "person", "people"],
        &["bug", "issue", "defect"],
        &["fast", "quick", "rapid"],
    ];
    let mut map = HashMap::new();
    for group in GROUPS {
        for member in *group {
            map.insert(*member, *group);
        }
    }
    map
});

/// Light suffix stem: strip -ing, -ed, -s when the remainder keeps
/// at least 3 characters.
fn stem(token: &str) -> String {
    for suffix in ["ing", "ed", "s"] {
        if let Some(base) = token.strip_suffix(suffix) {
            if base.len() >= 3 {
                return base.to_string();
            }
        }
    }
    token.to_string()
}

/// Canonical token sequence for a text. Idempotent: canonicalizing the
/// joined output yields the same tokens.
pub fn canonical_tokens(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in lower.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
        .into_iter()
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(t.as_str()))
        .map(|t| stem(&t))
        .collect()
}

/// Canonical token set expanded with synonyms. This is the search
/// document for a memory in the keyword fallback.
pub fn search_document(text: &str) -> HashSet<String> {
    let mut set: HashSet<String> = HashSet::new();
    for token in canonical_tokens(text) {
        if let Some(group) = SYNONYMS.get(token.as_str()) {
            for member in *group {
                set.insert((*member).to_string());
            }
        }
        set.insert(token);
    }
    set
}

/// Jaccard similarity of two token sets. Empty-vs-empty is 1.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Jaccard similarity of two raw texts over canonical tokens
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let sa: HashSet<String> = canonical_tokens(a).into_iter().collect();
    let sb: HashSet<String> = canonical_tokens(b).into_iter().collect();
    jaccard(&sa, &sb)
}

/// Top-K tokens by frequency (ties by first appearance), space-joined
pub fn top_keywords(text: &str, k: usize) -> String {
    let tokens = canonical_tokens(text);
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (pos, token) in tokens.iter().enumerate() {
        let entry = counts.entry(token.as_str()).or_insert((0, pos));
        entry.0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> =
        counts.into_iter().map(|(t, (n, pos))| (t, n, pos)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    ranked
        .into_iter()
        .take(k)
        .map(|(t, _, _)| t.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split into sentences on terminal punctuation
fn sentences(text: &str) -> Vec<&str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Extractive summary: the `layers` highest-scoring sentences in
/// original order, scored by canonical token frequency, truncated to
/// `max_chars`.
pub fn extractive_summary(text: &str, layers: usize, max_chars: usize) -> String {
    let sents = sentences(text);
    if sents.is_empty() {
        return truncate_chars(text, max_chars);
    }

    let mut freq: HashMap<String, usize> = HashMap::new();
    for token in canonical_tokens(text) {
        *freq.entry(token).or_insert(0) += 1;
    }

    let mut scored: Vec<(usize, f64)> = sents
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let tokens = canonical_tokens(s);
            if tokens.is_empty() {
                return (i, 0.0);
            }
            let score: usize = tokens.iter().map(|t| freq.get(t).copied().unwrap_or(0)).sum();
            (i, score as f64 / tokens.len() as f64)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut picked: Vec<usize> = scored.into_iter().take(layers.max(1)).map(|(i, _)| i).collect();
    picked.sort_unstable();

    let summary = picked
        .into_iter()
        .map(|i| sents[i])
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&summary, max_chars)
}

/// UTF-8 safe char truncation
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_drops_stopwords_and_short_tokens() {
        let tokens = canonical_tokens("The user prefers a dark theme, obviously!");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
        assert!(tokens.contains(&"user".to_string()));
        assert!(tokens.contains(&"dark".to_string()));
        // "prefers" stems to "prefer"
        assert!(tokens.contains(&"prefer".to_string()));
    }

    #[test]
    fn test_canonical_is_idempotent() {
        let text = "Running tasks and fixing bugs in the parser";
        let once = canonical_tokens(text);
        let twice = canonical_tokens(&once.join(" "));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_synonym_expansion_bridges_terms() {
        let doc = search_document("I prefer dark theme");
        // "likes" canonicalizes to "like"; the synonym group bridges it
        assert!(doc.contains("like"));
        assert!(doc.contains("mode"));
    }

    #[test]
    fn test_jaccard_bounds() {
        let empty: HashSet<String> = HashSet::new();
        assert_eq!(jaccard(&empty, &empty), 1.0);

        let a: HashSet<String> = ["x".to_string()].into_iter().collect();
        let b: HashSet<String> = ["y".to_string()].into_iter().collect();
        assert_eq!(jaccard(&a, &b), 0.0);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn test_top_keywords_by_frequency() {
        let text = "cache cache cache index index parser";
        assert_eq!(top_keywords(text, 3), "cache index parser");
        assert_eq!(top_keywords(text, 1), "cache");
    }

    #[test]
    fn test_extractive_summary_picks_dense_sentences() {
        let text = "Parser rewrite planned. The cache layer caches parser output for the parser. Unrelated aside.";
        let summary = extractive_summary(text, 1, 200);
        assert!(summary.contains("cache"));
    }

    #[test]
    fn test_truncate_chars_utf8() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
