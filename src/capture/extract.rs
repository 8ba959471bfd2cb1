//! Best-effort `(speaker, content, event kind)` extraction from untyped widget payloads.
//!
//! The widget's wire format is not under our control, so every lookup goes through
//! the ordered probe tables below rather than a fixed schema.

use chrono::{ DateTime, SecondsFormat, Utc };
use log::debug;
use serde_json::{ Map, Value };
use std::borrow::Cow;

use crate::models::transcript::Speaker;

/// Content longer than this is treated as binary garbage, not a message.
pub const MAX_CONTENT_CHARS: usize = 10_000;

pub const STRING_MESSAGE_KIND: &str = "string_message";
pub const UNKNOWN_KIND: &str = "unknown";

pub const EVENT_KIND_FIELDS: &[&str] = &["type", "event", "action"];
pub const CONTENT_FIELDS: &[&str] = &["content", "message", "text", "transcript"];
/// Containers re-probed when no top-level content field matches. Either a
/// mapping or a string holding embedded JSON.
pub const NESTED_FIELDS: &[&str] = &["payload", "data"];
pub const SPEAKER_FIELD: &str = "speaker";
pub const ROLE_FIELDS: &[&str] = &["from", "source", "role"];
pub const TIMESTAMP_FIELD: &str = "timestamp";

const USER_ROLES: &[&str] = &["user"];
const AVATAR_ROLES: &[&str] = &["assistant", "ai", "avatar"];
const USER_KIND_MARKER: &str = "user";
const AVATAR_KIND_MARKERS: &[&str] = &["avatar", "assistant", "bot"];
pub const LIFECYCLE_KEYWORDS: &[&str] = &["start", "begin", "end", "stop", "ready", "connected"];

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredEvent {
    pub event_kind: String,
    pub fields: Map<String, Value>,
}

impl StructuredEvent {
    pub fn new(fields: Map<String, Value>) -> Self {
        let event_kind = EVENT_KIND_FIELDS.iter()
            .find_map(|name| non_blank_str(&fields, name))
            .map(|kind| kind.trim().to_string())
            .unwrap_or_else(|| UNKNOWN_KIND.to_string());
        Self { event_kind, fields }
    }

    /// Nested containers in probe order. Unparseable ones are skipped.
    fn nested(&self) -> Vec<Cow<'_, Map<String, Value>>> {
        NESTED_FIELDS.iter()
            .filter_map(|name| self.fields.get(*name))
            .filter_map(as_container)
            .collect()
    }
}

/// An inbound widget message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Text(String),
    Structured(StructuredEvent),
    Unrecognized(Value),
}

impl From<Value> for IncomingMessage {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => IncomingMessage::Text(text),
            Value::Object(fields) => IncomingMessage::Structured(StructuredEvent::new(fields)),
            other => IncomingMessage::Unrecognized(other),
        }
    }
}

impl IncomingMessage {
    pub fn event_kind(&self) -> &str {
        match self {
            IncomingMessage::Text(_) => STRING_MESSAGE_KIND,
            IncomingMessage::Structured(event) => &event.event_kind,
            IncomingMessage::Unrecognized(_) => UNKNOWN_KIND,
        }
    }

    pub fn raw(&self) -> Value {
        match self {
            IncomingMessage::Text(text) => Value::String(text.clone()),
            IncomingMessage::Structured(event) => Value::Object(event.fields.clone()),
            IncomingMessage::Unrecognized(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub content: String,
    pub speaker: Speaker,
    pub event_kind: String,
    /// Emission time carried by the payload itself, normalized to UTC.
    pub timestamp: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    max_content_chars: usize,
}

impl Default for Extractor {
    fn default() -> Self {
        Self { max_content_chars: MAX_CONTENT_CHARS }
    }
}

impl Extractor {
    pub fn new(max_content_chars: usize) -> Self {
        Self { max_content_chars }
    }

    pub fn extract(&self, message: &IncomingMessage) -> Option<Extracted> {
        let (content, speaker, timestamp) = match message {
            IncomingMessage::Text(text) => (text.clone(), Speaker::Unknown, None),
            IncomingMessage::Structured(event) => {
                let nested = event.nested();
                let scopes: Vec<&Map<String, Value>> = std::iter::once(&event.fields)
                    .chain(nested.iter().map(|m| &**m))
                    .collect();
                let content = scopes
                    .iter()
                    .find_map(|scope| probe_content(scope))
                    .map(str::to_string)
                    .unwrap_or_default();
                let speaker = resolve_speaker(&scopes, &event.event_kind);
                let timestamp = scopes.iter().find_map(|scope| payload_timestamp(scope));
                (content, speaker, timestamp)
            }
            IncomingMessage::Unrecognized(value) => {
                debug!("Ignoring payload of unsupported shape: {}", value);
                return None;
            }
        };

        if content.trim().is_empty() {
            debug!("No content found in {} message", message.event_kind());
            return None;
        }
        let length = content.chars().count();
        if length > self.max_content_chars {
            debug!(
                "Dropping {} message with oversized content ({} > {} chars)",
                message.event_kind(),
                length,
                self.max_content_chars
            );
            return None;
        }

        Some(Extracted {
            content,
            speaker,
            event_kind: message.event_kind().to_string(),
            timestamp,
            raw: message.raw(),
        })
    }
}

pub fn extract(message: &IncomingMessage) -> Option<Extracted> {
    Extractor::default().extract(message)
}

/// Synthesizes a System line for conversation start/end events that carry no text.
pub fn lifecycle_announcement(message: &IncomingMessage) -> Option<Extracted> {
    let IncomingMessage::Structured(event) = message else {
        return None;
    };
    let words = kind_words(&event.event_kind);
    let content = if has_any(&words, &["start", "begin"]) {
        format!("Conversation started ({})", event.event_kind)
    } else if has_any(&words, &["end", "stop"]) {
        format!("Conversation ended ({})", event.event_kind)
    } else {
        return None;
    };
    Some(Extracted {
        content,
        speaker: Speaker::System,
        event_kind: event.event_kind.clone(),
        timestamp: None,
        raw: message.raw(),
    })
}

/// Speaker implied by the event kind alone.
pub fn speaker_from_kind(event_kind: &str) -> Speaker {
    let kind = event_kind.to_lowercase();
    if kind.contains(USER_KIND_MARKER) {
        return Speaker::User;
    }
    if AVATAR_KIND_MARKERS.iter().any(|m| kind.contains(m)) {
        return Speaker::AiAvatar;
    }
    if has_any(&kind_words(event_kind), LIFECYCLE_KEYWORDS) {
        return Speaker::System;
    }
    Speaker::Unknown
}

fn resolve_speaker(scopes: &[&Map<String, Value>], event_kind: &str) -> Speaker {
    if let Some(label) = scopes.iter().find_map(|scope| non_blank_str(scope, SPEAKER_FIELD)) {
        return Speaker::from_label(label);
    }
    for scope in scopes {
        for field in ROLE_FIELDS {
            let Some(role) = str_field(scope, field) else {
                continue;
            };
            let role = role.trim().to_lowercase();
            if USER_ROLES.contains(&role.as_str()) {
                return Speaker::User;
            }
            if AVATAR_ROLES.contains(&role.as_str()) {
                return Speaker::AiAvatar;
            }
        }
    }
    speaker_from_kind(event_kind)
}

fn probe_content(scope: &Map<String, Value>) -> Option<&str> {
    CONTENT_FIELDS.iter().find_map(|name| non_blank_str(scope, name))
}

fn payload_timestamp(scope: &Map<String, Value>) -> Option<String> {
    let raw = str_field(scope, TIMESTAMP_FIELD)?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub(crate) fn as_container(value: &Value) -> Option<Cow<'_, Map<String, Value>>> {
    match value {
        Value::Object(map) => Some(Cow::Borrowed(map)),
        Value::String(embedded) =>
            match serde_json::from_str::<Value>(embedded) {
                Ok(Value::Object(map)) => Some(Cow::Owned(map)),
                _ => None,
            }
        _ => None,
    }
}

fn str_field<'a>(scope: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    scope.get(name).and_then(Value::as_str)
}

fn non_blank_str<'a>(scope: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    str_field(scope, name).filter(|s| !s.trim().is_empty())
}

/// A keyword matches any word it prefixes, so `started` and `stopped` count.
fn has_any(words: &[String], keywords: &[&str]) -> bool {
    words.iter().any(|w| keywords.iter().any(|k| w.starts_with(k)))
}

/// Splits an event kind into lowercase words on separators and camelCase boundaries.
fn kind_words(event_kind: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in event_kind.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
