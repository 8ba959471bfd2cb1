use serde::{ Serialize, Deserialize, Serializer, Deserializer };
use serde_json::{ Map, Value };
use std::fmt;

/// Role label attached to a captured line. Inferred, never authoritative.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Speaker {
    User,
    AiAvatar,
    System,
    Unknown,
    Other(String),
}

impl Speaker {
    /// Maps a free-form label onto a known role, keeping anything else verbatim.
    pub fn from_label(label: &str) -> Self {
        let trimmed = label.trim();
        match trimmed.to_lowercase().as_str() {
            "" | "unknown" => Speaker::Unknown,
            "user" | "human" => Speaker::User,
            "ai avatar" | "avatar" | "assistant" | "ai" => Speaker::AiAvatar,
            "system" => Speaker::System,
            _ => Speaker::Other(trimmed.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Speaker::User => "User",
            Speaker::AiAvatar => "AI Avatar",
            Speaker::System => "System",
            Speaker::Unknown => "Unknown",
            Speaker::Other(label) => label.as_str(),
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for Speaker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Speaker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Speaker::from_label(&label))
    }
}

/// One persisted line of a conversation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TranscriptRecord {
    pub session_id: String,
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TranscriptRecord {
    /// Empty session, speaker or content makes a record unpersistable.
    pub fn is_persistable(&self) -> bool {
        !self.session_id.trim().is_empty()
            && !self.speaker.label().trim().is_empty()
            && !self.content.trim().is_empty()
    }
}

/// A record as read back from a store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredTranscript {
    pub id: String,
    pub created_at: String,
    #[serde(flatten)]
    pub record: TranscriptRecord,
}

/// Listing filter: optional session equality plus case-insensitive content search.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TranscriptQuery {
    pub session_id: Option<String>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl TranscriptQuery {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, row: &StoredTranscript) -> bool {
        if let Some(session_id) = self.session_id.as_deref().filter(|s| !s.is_empty()) {
            if row.record.session_id != session_id {
                return false;
            }
        }
        if let Some(term) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if !row.record.content.to_lowercase().contains(&term.to_lowercase()) {
                return false;
            }
        }
        true
    }

    /// Filters, orders newest first and truncates rows fetched from a store.
    pub fn apply(&self, rows: Vec<StoredTranscript>) -> Vec<StoredTranscript> {
        let mut rows: Vec<StoredTranscript> = rows
            .into_iter()
            .filter(|row| self.matches(row))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub message_count: usize,
    pub last_activity: String,
}

/// Groups rows by session, most recently active first.
pub fn summarize_sessions(rows: &[StoredTranscript]) -> Vec<SessionSummary> {
    let mut sessions: Vec<SessionSummary> = Vec::new();
    for row in rows {
        match sessions.iter_mut().find(|s| s.session_id == row.record.session_id) {
            Some(summary) => {
                summary.message_count += 1;
                if row.created_at > summary.last_activity {
                    summary.last_activity = row.created_at.clone();
                }
            }
            None =>
                sessions.push(SessionSummary {
                    session_id: row.record.session_id.clone(),
                    message_count: 1,
                    last_activity: row.created_at.clone(),
                }),
        }
    }
    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, session: &str, content: &str, created_at: &str) -> StoredTranscript {
        StoredTranscript {
            id: id.to_string(),
            created_at: created_at.to_string(),
            record: TranscriptRecord {
                session_id: session.to_string(),
                speaker: Speaker::User,
                content: content.to_string(),
                timestamp: created_at.to_string(),
                metadata: Map::new(),
            },
        }
    }

    #[test]
    fn speaker_labels_normalize_known_roles() {
        assert_eq!(Speaker::from_label("user"), Speaker::User);
        assert_eq!(Speaker::from_label(" AI Avatar "), Speaker::AiAvatar);
        assert_eq!(Speaker::from_label("assistant"), Speaker::AiAvatar);
        assert_eq!(Speaker::from_label("System"), Speaker::System);
        assert_eq!(Speaker::from_label("Interviewer"), Speaker::Other("Interviewer".into()));
    }

    #[test]
    fn speaker_serializes_as_label() {
        let json = serde_json::to_string(&Speaker::AiAvatar).unwrap();
        assert_eq!(json, r#""AI Avatar""#);
        let back: Speaker = serde_json::from_str(r#""User""#).unwrap();
        assert_eq!(back, Speaker::User);
    }

    #[test]
    fn query_filters_by_session_and_search() {
        let rows = vec![
            row("1", "a", "Hello there", "2026-01-01T00:00:01Z"),
            row("2", "b", "hello again", "2026-01-01T00:00:02Z"),
            row("3", "a", "Goodbye", "2026-01-01T00:00:03Z")
        ];
        let query = TranscriptQuery {
            session_id: Some("a".into()),
            search: Some("HELLO".into()),
            limit: None,
        };
        let result = query.apply(rows.clone());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "1");

        let all = TranscriptQuery::default().apply(rows);
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
    }

    #[test]
    fn stored_transcript_flattens_record() {
        let json = serde_json::to_value(row("7", "s", "hi", "2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(json["id"], "7");
        assert_eq!(json["session_id"], "s");
        assert_eq!(json["speaker"], "User");
    }

    #[test]
    fn sessions_are_grouped_newest_first() {
        let rows = vec![
            row("1", "a", "x", "2026-01-01T00:00:01Z"),
            row("2", "b", "y", "2026-01-01T00:00:05Z"),
            row("3", "a", "z", "2026-01-01T00:00:03Z")
        ];
        let sessions = summarize_sessions(&rows);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "b");
        assert_eq!(sessions[1].message_count, 2);
        assert_eq!(sessions[1].last_activity, "2026-01-01T00:00:03Z");
    }
}
