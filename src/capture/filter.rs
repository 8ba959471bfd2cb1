use chrono::{ SecondsFormat, Utc };
use log::debug;
use once_cell::sync::Lazy;
use serde::{ Deserialize, Serialize };
use serde_json::{ Map, Value };
use std::fmt;

use super::extract::{ as_container, Extracted };
use crate::models::transcript::TranscriptRecord;

/// Denylist data for the noise filter. All matching is case-insensitive.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NoiseRules {
    /// Substrings of an event kind that identify unrelated widgets sharing the page.
    pub foreign_widget_markers: Vec<String>,
    /// Event kinds used by lifecycle "ready" pings.
    pub ready_kinds: Vec<String>,
    /// Canned content carried by those pings.
    pub ready_phrases: Vec<String>,
    /// Event kinds of our own outbound init probes.
    pub probe_kinds: Vec<String>,
}

impl Default for NoiseRules {
    fn default() -> Self {
        Self {
            foreign_widget_markers: owned(&["intercom", "drift", "zendesk", "hubspot", "crisp"]),
            ready_kinds: owned(&["ready", "streaming-embed", "avatar_ready"]),
            ready_phrases: owned(
                &["ready", "avatar ready", "heygen avatar ready for interaction", "connected"]
            ),
            probe_kinds: owned(&["init", "handshake"]),
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NoContent,
    MissingSession,
    ForeignWidget(String),
    ReadyPing,
    SelfProbe,
    ProbeEcho,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoContent => write!(f, "no usable content"),
            DropReason::MissingSession => write!(f, "no active session"),
            DropReason::ForeignWidget(marker) => write!(f, "foreign widget chatter ({})", marker),
            DropReason::ReadyPing => write!(f, "canned ready ping"),
            DropReason::SelfProbe => write!(f, "own init probe kind"),
            DropReason::ProbeEcho => write!(f, "echo of own init probe"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    rules: NoiseRules,
}

static DEFAULT_FILTER: Lazy<NoiseFilter> = Lazy::new(NoiseFilter::default);

impl NoiseFilter {
    pub fn new(rules: NoiseRules) -> Self {
        Self { rules }
    }

    /// Returns why an extracted message must not be persisted, if it must not.
    pub fn check(&self, extracted: &Extracted, session_id: &str) -> Option<DropReason> {
        if session_id.trim().is_empty() {
            return Some(DropReason::MissingSession);
        }
        if extracted.content.trim().is_empty() || extracted.speaker.label().trim().is_empty() {
            return Some(DropReason::NoContent);
        }

        let kind = extracted.event_kind.trim().to_lowercase();
        if let Some(marker) = self.rules.foreign_widget_markers
            .iter()
            .find(|m| !m.is_empty() && kind.contains(&m.to_lowercase()))
        {
            return Some(DropReason::ForeignWidget(marker.clone()));
        }

        let content = extracted.content.trim().to_lowercase();
        if
            contains_ignore_case(&self.rules.ready_kinds, &kind) &&
            contains_ignore_case(&self.rules.ready_phrases, &content)
        {
            return Some(DropReason::ReadyPing);
        }

        if contains_ignore_case(&self.rules.probe_kinds, &kind) {
            return Some(DropReason::SelfProbe);
        }
        if carries_session_id(&extracted.raw, session_id) {
            return Some(DropReason::ProbeEcho);
        }
        None
    }

    pub fn filter_and_tag(
        &self,
        extracted: Option<Extracted>,
        session_id: &str
    ) -> Option<TranscriptRecord> {
        let extracted = extracted?;
        if let Some(reason) = self.check(&extracted, session_id) {
            debug!("Dropping {} message: {}", extracted.event_kind, reason);
            return None;
        }

        let timestamp = extracted.timestamp.unwrap_or_else(now_iso);
        let mut metadata = Map::new();
        metadata.insert("messageType".to_string(), Value::String(extracted.event_kind));
        metadata.insert("originalData".to_string(), extracted.raw);

        let record = TranscriptRecord {
            session_id: session_id.to_string(),
            speaker: extracted.speaker,
            content: extracted.content.trim().to_string(),
            timestamp,
            metadata,
        };
        record.is_persistable().then_some(record)
    }
}

pub fn filter_and_tag(extracted: Option<Extracted>, session_id: &str) -> Option<TranscriptRecord> {
    DEFAULT_FILTER.filter_and_tag(extracted, session_id)
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn contains_ignore_case(items: &[String], needle: &str) -> bool {
    items.iter().any(|item| item.trim().eq_ignore_ascii_case(needle))
}

/// Our init probes carry the session id; a payload echoing it back is our own traffic.
fn carries_session_id(raw: &Value, session_id: &str) -> bool {
    let Value::Object(fields) = raw else {
        return false;
    };
    let direct = fields.get("session_id").and_then(Value::as_str) == Some(session_id);
    direct ||
        ["payload", "data"]
            .iter()
            .filter_map(|name| fields.get(*name))
            .filter_map(as_container)
            .any(|nested| {
                nested.get("session_id").and_then(Value::as_str) == Some(session_id)
            })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::extract::{ extract, IncomingMessage };
    use crate::models::transcript::Speaker;
    use serde_json::json;

    const SESSION: &str = "session_1700000000000_abc123xyz";

    fn tag(value: Value) -> Option<TranscriptRecord> {
        filter_and_tag(extract(&IncomingMessage::from(value)), SESSION)
    }

    #[test]
    fn none_stays_none() {
        assert!(filter_and_tag(None, SESSION).is_none());
    }

    #[test]
    fn tags_surviving_messages() {
        let payload = json!({"type": "avatar_speech", "data": {"content": "  Hi there "}});
        let record = tag(payload.clone()).unwrap();
        assert_eq!(record.session_id, SESSION);
        assert_eq!(record.speaker, Speaker::AiAvatar);
        assert_eq!(record.content, "Hi there");
        assert_eq!(record.metadata["originalData"], payload);
        assert_eq!(record.metadata["messageType"], "avatar_speech");
        assert!(chrono::DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
    }

    #[test]
    fn payload_timestamp_is_preferred() {
        let record = tag(
            json!({"type": "transcript", "content": "x", "timestamp": "2026-01-02T03:04:05Z"})
        ).unwrap();
        assert_eq!(record.timestamp, "2026-01-02T03:04:05.000Z");
    }

    #[test]
    fn empty_session_is_rejected() {
        let extracted = extract(&IncomingMessage::from(json!("hello")));
        assert!(filter_and_tag(extracted.clone(), "").is_none());
        assert!(filter_and_tag(extracted, "  ").is_none());
    }

    #[test]
    fn canned_ready_pings_are_dropped() {
        for kind in ["ready", "READY", "streaming-embed", "avatar_ready"] {
            for phrase in ["ready", "Ready", "HeyGen avatar ready for interaction"] {
                assert!(tag(json!({"type": kind, "content": phrase})).is_none(), "{}/{}", kind, phrase);
            }
        }
        assert!(tag(json!({"type": "ready", "content": "Hello, I am June"})).is_some());
        assert!(tag(json!({"type": "avatar_speech", "content": "ready"})).is_some());
    }

    #[test]
    fn foreign_widgets_are_dropped() {
        assert!(tag(json!({"type": "intercom-snippet", "content": "Need help?"})).is_none());
        assert!(tag(json!({"event": "Drift:message", "text": "hi"})).is_none());
    }

    #[test]
    fn own_probes_are_not_recaptured() {
        assert!(tag(json!({"type": "init", "content": "init"})).is_none());
        assert!(tag(json!({"action": "init", "message": "hello"})).is_none());
        assert!(
            tag(json!({"type": "relay", "session_id": SESSION, "text": "echo"})).is_none()
        );
        assert!(
            tag(json!({"type": "relay", "data": {"session_id": SESSION, "text": "echo"}})).is_none()
        );
        let embedded = json!({"session_id": SESSION, "text": "echo"}).to_string();
        assert!(tag(json!({"type": "relay", "payload": embedded})).is_none());
        assert!(
            tag(json!({"type": "relay", "session_id": "someone_else", "text": "hi"})).is_some()
        );
    }

    #[test]
    fn identical_payloads_are_not_deduplicated() {
        let payload = json!({"type": "user_message", "data": {"message": "Hello"}});
        assert!(tag(payload.clone()).is_some());
        assert!(tag(payload).is_some());
    }

    #[test]
    fn custom_rules_apply() {
        let filter = NoiseFilter::new(NoiseRules {
            foreign_widget_markers: vec!["tawk".into()],
            ..NoiseRules::default()
        });
        let extracted = extract(&IncomingMessage::from(json!({"type": "tawk_msg", "content": "x"})));
        assert_eq!(
            filter.check(extracted.as_ref().unwrap(), SESSION),
            Some(DropReason::ForeignWidget("tawk".into()))
        );
        let intercom = extract(&IncomingMessage::from(json!({"type": "intercom", "content": "x"})));
        assert!(filter.filter_and_tag(intercom, SESSION).is_some());
    }
}
