use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::models::TokenUsage;

pub const DEFAULT_TEMPERATURE: f64 = 0.3;
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const MIN_MAX_TOKENS: u32 = 128;
pub const MAX_MAX_TOKENS: u32 = 2048;

/// Aliases that resolve to a provider's heavy-tier model.
const HEAVY_ALIASES: [&str; 2] = ["smart", "heavy"];

pub const SYSTEM_PROMPT: &str = "You are an expert coding assistant for CodeJoin.\n\
- Use concise Markdown with short headings, bullets, and fenced code blocks (with language tags).\n\
- Focus on the requested task; avoid repetition and apologies.\n\
- When showing code, keep it minimal and directly runnable where possible.";

/// Accepted only when a number in [0, 1]; anything else gets the default.
pub fn resolve_temperature(raw: Option<&Value>) -> f64 {
    match raw.and_then(Value::as_f64) {
        Some(t) if (0.0..=1.0).contains(&t) => t,
        _ => DEFAULT_TEMPERATURE,
    }
}

/// Numbers are floored, then clamped to [128, 2048]; anything else gets
/// the default.
pub fn resolve_max_tokens(raw: Option<&Value>) -> u32 {
    match raw.and_then(Value::as_f64) {
        Some(v) => (v.floor() as i64).clamp(MIN_MAX_TOKENS as i64, MAX_MAX_TOKENS as i64) as u32,
        None => DEFAULT_MAX_TOKENS,
    }
}

/// Trims the requested model name; an empty string counts as absent.
pub fn requested_model(model: Option<&str>) -> Option<String> {
    model
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Shared alias resolution: `smart`/`heavy` (case-insensitive) map to the
/// provider's heavy-tier model, other names pass through verbatim, absence
/// takes the provider default. Runs once, before the first attempt.
pub fn resolve_model(requested: Option<&str>, default_model: &str, heavy_model: &str) -> String {
    match requested {
        Some(name) if HEAVY_ALIASES.contains(&name.to_lowercase().as_str()) => {
            heavy_model.to_string()
        }
        Some(name) => name.to_string(),
        None => default_model.to_string(),
    }
}

/// Server-derived fields folded into the context payload. `request_id` and
/// `timestamp` always win over caller-supplied keys.
pub struct ContextExtras {
    pub conversation_id: Option<Value>,
    pub project_id: Option<Value>,
    pub request_id: String,
    pub timestamp: String,
}

impl ContextExtras {
    fn into_map(self) -> Map<String, Value> {
        let mut extras = Map::new();
        if let Some(conversation_id) = self.conversation_id {
            extras.insert("conversationId".to_string(), conversation_id);
        }
        if let Some(project_id) = self.project_id {
            extras.insert("projectId".to_string(), project_id);
        }
        extras.insert("requestId".to_string(), Value::String(self.request_id));
        extras.insert("timestamp".to_string(), Value::String(self.timestamp));
        extras
    }
}

/// The context merge rule:
/// - non-array object: shallow-merge extras over it;
/// - string with non-empty trim: `{ summary: <string>, ...extras }`;
/// - anything else: extras alone.
pub fn build_context_payload(context: Option<&Value>, extras: ContextExtras) -> Map<String, Value> {
    let extras = extras.into_map();
    match context {
        Some(Value::Object(fields)) => {
            let mut merged = fields.clone();
            merged.extend(extras);
            merged
        }
        Some(Value::String(text)) if !text.trim().is_empty() => {
            let mut merged = Map::new();
            merged.insert("summary".to_string(), Value::String(text.clone()));
            merged.extend(extras);
            merged
        }
        _ => extras,
    }
}

/// A string `selectedModel` carried in the merged context, used by the
/// secondary chat family before its default applies.
pub fn selected_model(payload: &Map<String, Value>) -> Option<String> {
    match payload.get("selectedModel") {
        Some(Value::String(model)) if !model.trim().is_empty() => Some(model.clone()),
        _ => None,
    }
}

/// Concatenates the fixed instruction block with any free-text context
/// sections, omitting empty ones, blank-line separated.
pub fn system_preamble(payload: &Map<String, Value>) -> String {
    let mut sections = vec![SYSTEM_PROMPT.to_string()];
    if let Some(Value::String(system_context)) = payload.get("systemContext") {
        if !system_context.is_empty() {
            sections.push(system_context.clone());
        }
    }
    if let Some(Value::String(file_context)) = payload.get("fileContext") {
        if !file_context.is_empty() {
            sections.push(format!(
                "Project file context (may be truncated):\n{}",
                file_context
            ));
        }
    }
    sections.join("\n\n")
}

/// total_tokens, then completion_tokens, then prompt_tokens, then 0.
pub fn resolve_tokens_used(usage: Option<&TokenUsage>) -> u64 {
    let Some(usage) = usage else { return 0 };
    usage
        .total_tokens
        .or(usage.completion_tokens)
        .or(usage.prompt_tokens)
        .unwrap_or(0)
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("req-{}-{}", ts, seq)
}

pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub fn elapsed_ms(start: &Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
