//! Detection of memorable content in chat turns.
//!
//! Classification is delegated to a [`Classifier`]. The detector bounds the
//! input, applies the call timeout, and validates whatever comes back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mnemos_common::{ConversationTurn, MnemosError, Result};
use mnemos_llm::{ChatMessage, LlmClient, LlmRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::config::DetectorConfig;
use crate::facts::split_into_facts;
use crate::monitor::{components, elapsed_ms, PerformanceMonitor};
use crate::text::{collapse_whitespace, extract_keywords, normalize, normalize_keywords, truncate_chars};
use crate::types::{CandidateMemory, MemoryCategory, MAX_KEYWORDS};

/// Separates rendered history from the message being classified.
pub const MESSAGE_MARKER: &str = "Current message:";

/// Output shape requested from classifiers.
pub const SCHEMA_HINT: &str = r#"{"memories": [{"content": string (10-500 chars, third person not required), "category": "preference" | "personal_info" | "context" | "instruction", "importance": number 0.0-1.0, "keywords": [string]}]}"#;

const DETECTION_PROMPT: &str = "You extract long-term memories about the user from a chat message. \
Only record durable information: preferences, personal facts, ongoing context and standing instructions. \
Ignore small talk, questions and anything about the assistant. \
Return an empty list when nothing is worth remembering. Respond with JSON only, matching:";

/// Turns text into structured candidate memories.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, schema_hint: &str) -> Result<Value>;
    fn name(&self) -> &str;
}

/// Classifies through any [`LlmClient`].
pub struct LlmClassifier {
    client: Arc<dyn LlmClient>,
}

impl LlmClassifier {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    #[instrument(skip(self, text, schema_hint), fields(model = %self.client.model_name()))]
    async fn classify(&self, text: &str, schema_hint: &str) -> Result<Value> {
        let request = LlmRequest {
            system_prompt: Some(format!("{DETECTION_PROMPT}\n{schema_hint}")),
            messages: vec![ChatMessage::user(text)],
            temperature: Some(0.1),
            max_tokens: Some(512),
            json_output: true,
        };
        let response = self.client.complete(request).await?;

        let Some(raw) = extract_json(&response.content) else {
            warn!("Classifier response contained no JSON, treating as no memories");
            return Ok(json!({ "memories": [] }));
        };
        match serde_json::from_str(raw) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(error = %e, "Classifier returned malformed JSON, treating as no memories");
                Ok(json!({ "memories": [] }))
            }
        }
    }

    fn name(&self) -> &str {
        self.client.model_name()
    }
}

/// Returns the first balanced JSON object or array in `s`, skipping braces
/// inside string literals.
pub fn extract_json(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

struct Cue {
    category: MemoryCategory,
    importance: f32,
    pattern: Regex,
}

// Checked in order; the first matching cue decides the category.
static CUES: Lazy<Vec<Cue>> = Lazy::new(|| {
    let table: [(MemoryCategory, f32, &str); 4] = [
        (
            MemoryCategory::Instruction,
            0.8,
            r"(?i)\b(always (reply|respond|answer|use|call|write)|never (use|call|mention|schedule|send)|from now on|please (remember|don't|do not)|make sure (to|you))\b",
        ),
        (
            MemoryCategory::PersonalInfo,
            0.7,
            r"(?i)\b(my name is|call me|i live in|i'm from|i am from|i work (as|at|for)|i'm (a|an) \w+ by|i am \d+|i'm \d+|my (wife|husband|partner|sister|brother|son|daughter|mother|father|mom|dad|birthday|dog|cat)\b)",
        ),
        (
            MemoryCategory::Preference,
            0.6,
            r"(?i)\b(i (really |usually |always )?(prefer|like|love|enjoy|hate|dislike|can't stand)|my favou?rite)\b",
        ),
        (
            MemoryCategory::Context,
            0.5,
            r"(?i)\b(i'm working on|i am working on|i'm planning|i am planning|i'm preparing|i'm currently|i am currently|my deadline|this week i|next week i)\b",
        ),
    ];
    table
        .into_iter()
        .filter_map(|(category, importance, pattern)| match Regex::new(pattern) {
            Ok(pattern) => Some(Cue {
                category,
                importance,
                pattern,
            }),
            Err(e) => {
                warn!(category = %category, error = %e, "Invalid cue pattern skipped");
                None
            }
        })
        .collect()
});

/// Offline classifier driven by phrase cues. Only the current message is
/// inspected; history is context for model-backed classifiers.
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_sentence(sentence: &str) -> Option<(MemoryCategory, f32)> {
        CUES.iter()
            .find(|cue| cue.pattern.is_match(sentence))
            .map(|cue| (cue.category, cue.importance))
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str, _schema_hint: &str) -> Result<Value> {
        let message = current_message(text);
        let memories: Vec<Value> = split_into_facts(message)
            .into_iter()
            .filter_map(|sentence| {
                Self::classify_sentence(&sentence).map(|(category, importance)| {
                    json!({
                        "content": sentence,
                        "category": category.as_str(),
                        "importance": importance,
                    })
                })
            })
            .collect();
        Ok(json!({ "memories": memories }))
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// The part of rendered classifier input after the first [`MESSAGE_MARKER`]
/// that starts a line, or all of it when there is none. History lines always
/// start with a role, so the first line-leading marker is the real one.
pub fn current_message(text: &str) -> &str {
    let mut from = 0;
    while let Some(pos) = text[from..].find(MESSAGE_MARKER) {
        let idx = from + pos;
        if idx == 0 || text[..idx].ends_with('\n') {
            return text[idx + MESSAGE_MARKER.len()..].trim();
        }
        from = idx + MESSAGE_MARKER.len();
    }
    text.trim()
}

/// Input to a detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRequest {
    pub owner_id: String,
    pub message: String,
    /// Prior turns, most recent last
    #[serde(default)]
    pub recent_history: Vec<ConversationTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
}

impl DetectionRequest {
    pub fn new(owner_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            message: message.into(),
            recent_history: Vec::new(),
            source_conversation_id: None,
            source_message_id: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.recent_history = history;
        self
    }

    pub fn with_source(
        mut self,
        conversation_id: Option<String>,
        message_id: Option<String>,
    ) -> Self {
        self.source_conversation_id = conversation_id;
        self.source_message_id = message_id;
        self
    }
}

pub struct Detector {
    classifier: Arc<dyn Classifier>,
    monitor: Arc<PerformanceMonitor>,
    config: DetectorConfig,
}

impl Detector {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        monitor: Arc<PerformanceMonitor>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            classifier,
            monitor,
            config,
        }
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Candidates found in the message. Backend failures and timeouts yield
    /// an empty list.
    pub async fn detect(&self, request: &DetectionRequest) -> Vec<CandidateMemory> {
        match self.try_detect(request).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(owner_id = %request.owner_id, error = %e, "Detection failed, no memories recorded");
                Vec::new()
            }
        }
    }

    /// Like [`Detector::detect`] but surfaces failures so background workers
    /// can retry them.
    pub async fn try_detect(&self, request: &DetectionRequest) -> Result<Vec<CandidateMemory>> {
        let message = collapse_whitespace(&request.message);
        if message.is_empty() {
            return Err(MnemosError::validation("message must not be empty"));
        }
        let input = self.render_input(&message, &request.recent_history);
        let timeout = Duration::from_millis(self.config.timeout_ms);

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, self.classifier.classify(&input, SCHEMA_HINT)).await {
            Ok(result) => result,
            Err(_) => Err(MnemosError::Timeout(format!(
                "classifier '{}' exceeded {}ms",
                self.classifier.name(),
                self.config.timeout_ms
            ))),
        };
        self.monitor
            .record_sample(components::DETECTOR, elapsed_ms(start), result.is_ok());

        let candidates = parse_candidates(&result?, self.config.max_candidates);
        debug!(
            owner_id = %request.owner_id,
            candidates = candidates.len(),
            classifier = %self.classifier.name(),
            "Detection complete"
        );
        Ok(candidates)
    }

    fn render_input(&self, message: &str, history: &[ConversationTurn]) -> String {
        let message = truncate_chars(message, self.config.max_message_chars);
        let skip = history.len().saturating_sub(self.config.max_history_turns);
        let turns: Vec<String> = history[skip..]
            .iter()
            .map(|turn| {
                let content = collapse_whitespace(&turn.content);
                format!(
                    "{}: {}",
                    turn.role.as_str(),
                    truncate_chars(&content, self.config.max_history_chars)
                )
            })
            .collect();

        if turns.is_empty() {
            format!("{MESSAGE_MARKER}\n{message}")
        } else {
            format!("Recent conversation:\n{}\n\n{MESSAGE_MARKER}\n{message}", turns.join("\n"))
        }
    }
}

/// Validated candidates from classifier output. Accepts `{"memories": [...]}`,
/// a bare array, or a single candidate object.
pub fn parse_candidates(value: &Value, max_candidates: usize) -> Vec<CandidateMemory> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("memories") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(_) => Vec::new(),
            None if map.contains_key("content") => vec![value],
            None => Vec::new(),
        },
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for item in items {
        if candidates.len() == max_candidates {
            break;
        }
        let candidate = match parse_candidate(item) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(error = %e, "Rejected candidate");
                continue;
            }
        };
        if seen.insert(normalize(&candidate.content)) {
            candidates.push(candidate);
        }
    }
    candidates
}

fn parse_candidate(item: &Value) -> Result<CandidateMemory> {
    let content = item
        .get("content")
        .and_then(Value::as_str)
        .map(collapse_whitespace)
        .ok_or_else(|| MnemosError::validation("candidate has no content"))?;
    let category: MemoryCategory = item
        .get("category")
        .and_then(Value::as_str)
        .ok_or_else(|| MnemosError::validation("candidate has no category"))?
        .parse()?;
    let importance = match item.get("importance") {
        None | Some(Value::Null) => 0.5,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| MnemosError::validation("importance is not a number"))?
            as f32,
    };

    let keywords = item
        .get("keywords")
        .and_then(Value::as_array)
        .map(|kws| normalize_keywords(kws.iter().filter_map(Value::as_str)))
        .unwrap_or_default();
    let keywords = if keywords.is_empty() {
        extract_keywords(&content, MAX_KEYWORDS)
    } else {
        keywords
    };

    let candidate = CandidateMemory::new(content, category, importance).with_keywords(keywords);
    candidate.validate()?;
    Ok(candidate)
}
