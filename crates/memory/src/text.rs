//! Lexical helpers shared by detection, deduplication and ranking.

use std::collections::HashSet;

use crate::types::MAX_KEYWORDS;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "being", "but", "by", "can", "could", "did", "do", "does", "doing", "don", "for",
    "from", "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how",
    "i", "if", "im", "in", "into", "is", "it", "its", "just", "ll", "me", "more", "most", "my",
    "myself", "no", "not", "now", "of", "on", "one", "only", "or", "other", "our", "out", "over",
    "re", "really", "so", "some", "such", "than", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "those", "to", "too", "up", "us", "ve", "very", "was",
    "we", "were", "what", "when", "where", "which", "while", "who", "why", "will", "with",
    "would", "you", "your",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.binary_search(&token).is_ok()
}

/// Lower-cased alphanumeric runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Crude suffix stripping so "workouts"/"workout" and "mornings"/"morning"
/// compare equal. Not a linguistic stemmer.
pub fn stem(token: &str) -> String {
    let mut t = token.to_string();
    if t.len() > 4 && t.ends_with("ies") {
        t.truncate(t.len() - 3);
        t.push('y');
    } else if t.len() > 3
        && t.ends_with('s')
        && !t.ends_with("ss")
        && !t.ends_with("us")
        && !t.ends_with("is")
    {
        t.pop();
    }
    if t.len() > 5 && t.ends_with("ing") {
        t.truncate(t.len() - 3);
    } else if t.len() > 4 && t.ends_with("ed") {
        t.truncate(t.len() - 2);
    }
    t
}

/// Stemmed, stop-word filtered token set.
pub fn content_terms(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.len() > 1 && !is_stopword(t))
        .map(|t| stem(&t))
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Lower-case, strip punctuation and collapse whitespace. Two texts with
/// equal normal forms are treated as exact duplicates.
pub fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Longest prefix of at most `max_chars` chars, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Content words in first-occurrence order.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().count() >= 3 && !is_stopword(t) && !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| seen.insert(t.clone()))
        .take(max)
        .collect()
}

/// Trimmed, lower-cased, de-duplicated, at most [`MAX_KEYWORDS`].
pub fn normalize_keywords<I, S>(keywords: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for kw in keywords {
        let kw = collapse_whitespace(kw.as_ref()).to_lowercase();
        if kw.is_empty() || out.contains(&kw) {
            continue;
        }
        out.push(kw);
        if out.len() == MAX_KEYWORDS {
            break;
        }
    }
    out
}

/// Ordered union, existing keywords first.
pub fn merge_keywords(existing: &[String], incoming: &[String]) -> Vec<String> {
    normalize_keywords(existing.iter().chain(incoming.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwords_are_sorted_for_binary_search() {
        let mut sorted = STOPWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOPWORDS);
        assert!(is_stopword("the"));
        assert!(!is_stopword("workout"));
    }

    #[test]
    fn stem_conflates_simple_inflections() {
        assert_eq!(stem("workouts"), stem("workout"));
        assert_eq!(stem("mornings"), stem("morning"));
        assert_eq!(stem("preferences"), "preference");
        assert_eq!(stem("hobbies"), "hobby");
        assert_eq!(stem("glass"), "glass");
        assert_eq!(stem("is"), "is");
    }

    #[test]
    fn normalize_ignores_case_and_punctuation() {
        assert_eq!(normalize("  I prefer   TEA! "), "i prefer tea");
        assert_eq!(normalize("I prefer tea."), normalize("i prefer tea"));
    }

    #[test]
    fn content_terms_drop_stopwords() {
        let terms = content_terms("I am working on the Rust compiler");
        assert!(terms.contains("rust"));
        assert!(terms.contains("compiler"));
        assert!(terms.contains("work"));
        assert!(!terms.contains("the"));
        assert!(!terms.contains("i"));
    }

    #[test]
    fn jaccard_bounds() {
        let a = content_terms("morning workouts");
        let b = content_terms("workouts in the morning");
        assert!((jaccard(&a, &b) - 1.0).abs() < f32::EPSILON);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 0.0);
        let c = content_terms("green tea");
        assert_eq!(jaccard(&a, &c), 0.0);
    }

    #[test]
    fn keywords_keep_first_occurrence_order() {
        let kws = extract_keywords("I prefer green tea, green tea in the morning", 10);
        assert_eq!(kws, vec!["prefer", "green", "tea", "morning"]);
        assert_eq!(extract_keywords("running swimming cycling", 2).len(), 2);
    }

    #[test]
    fn merge_keywords_is_ordered_union_capped() {
        let a: Vec<String> = vec!["tea".into(), "morning".into()];
        let b: Vec<String> = vec!["Morning".into(), "green".into()];
        assert_eq!(merge_keywords(&a, &b), vec!["tea", "morning", "green"]);

        let many: Vec<String> = (0..20).map(|i| format!("kw{i}")).collect();
        assert_eq!(merge_keywords(&many, &[]).len(), MAX_KEYWORDS);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
