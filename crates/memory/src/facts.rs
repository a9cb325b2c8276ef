//! Splitting memory content into atomic facts and merging fact sets.

use crate::text::{content_terms, jaccard, normalize};

/// Token-set Jaccard at or above which two facts say the same thing.
const REDUNDANCY_JACCARD: f32 = 0.8;

/// Splits on sentence terminators, `;` and newlines. A `.`, `!` or `?` only
/// ends a fact when followed by whitespace or the end of input, so "3.5km"
/// stays intact. Terminal punctuation is kept with its fact.
pub fn split_into_facts(content: &str) -> Vec<String> {
    let mut facts = Vec::new();
    let mut current = String::new();
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ';' | '\n' => flush(&mut current, &mut facts),
            '.' | '!' | '?' => {
                current.push(c);
                if chars.peek().map_or(true, |n| n.is_whitespace()) {
                    flush(&mut current, &mut facts);
                }
            }
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut facts);
    facts
}

fn flush(current: &mut String, facts: &mut Vec<String>) {
    let fact = current.trim();
    if !normalize(fact).is_empty() {
        facts.push(fact.to_string());
    }
    current.clear();
}

/// Joins facts into prose, adding a period between facts that lack one.
pub fn join_facts(facts: &[String]) -> String {
    let last = facts.len().saturating_sub(1);
    facts
        .iter()
        .enumerate()
        .map(|(i, fact)| {
            if i < last && !fact.ends_with(['.', '!', '?']) {
                format!("{fact}.")
            } else {
                fact.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when `fact` adds nothing to `known`: the two say the same thing, or
/// every term of `fact` already appears in `known`.
pub fn is_redundant(known: &str, fact: &str) -> bool {
    let tk = content_terms(known);
    let tf = content_terms(fact);
    if tk.is_empty() || tf.is_empty() {
        return normalize(known) == normalize(fact);
    }
    jaccard(&tk, &tf) >= REDUNDANCY_JACCARD || tf.is_subset(&tk)
}

/// True when `fact` restates `known` and adds detail to it.
fn refines(fact: &str, known: &str) -> bool {
    let tk = content_terms(known);
    let tf = content_terms(fact);
    !tk.is_empty() && tk.len() < tf.len() && tk.is_subset(&tf)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedContent {
    pub content: String,
    /// Facts from the incoming text that made it into `content`
    pub added: Vec<String>,
}

/// Merges the facts of `incoming` into `existing`. Facts already stated are
/// skipped, a fact that refines an existing one takes its place, and the
/// rest are appended. Facts that would push the result past `max_chars` are
/// dropped. Returns `None` when nothing new survives.
pub fn merge_facts(existing: &str, incoming: &str, max_chars: usize) -> Option<MergedContent> {
    let mut facts = split_into_facts(existing);
    if facts.is_empty() {
        facts.push(existing.trim().to_string());
    }

    let mut added = Vec::new();
    for fact in split_into_facts(incoming) {
        if facts.iter().any(|known| is_redundant(known, &fact)) {
            continue;
        }

        let mut candidate = facts.clone();
        match candidate.iter().position(|known| refines(&fact, known)) {
            Some(at) => {
                candidate[at] = fact.clone();
                // any other fact the refinement covers goes too
                candidate.retain(|known| !refines(&fact, known));
            }
            None => candidate.push(fact.clone()),
        }
        if join_facts(&candidate).chars().count() > max_chars {
            continue;
        }
        facts = candidate;
        added.push(fact);
    }

    if added.is_empty() {
        return None;
    }
    Some(MergedContent {
        content: join_facts(&facts),
        added,
    })
}
