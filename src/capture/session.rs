use chrono::Utc;
use log::{ debug, info, warn };
use serde::{ Deserialize, Serialize };
use serde_json::{ json, Value };
use std::collections::VecDeque;
use uuid::Uuid;

use super::extract::{ as_container, lifecycle_announcement, Extractor, IncomingMessage };
use super::filter::{ now_iso, NoiseFilter };
use super::origin::OriginGate;
use super::transport::{ TransportDecision, TransportMode, TransportSelector };
use crate::config::capture::CaptureConfig;
use crate::models::transcript::{ Speaker, TranscriptRecord };
use crate::models::websocket::{ NoticeLevel, ServerMessage, WidgetStatus };

/// Number of recent lines carried in a survey summary.
pub const SUMMARY_WINDOW: usize = 10;
const SUFFIX_LEN: usize = 9;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbedProfile {
    #[default]
    Dashboard,
    Survey,
}

impl EmbedProfile {
    pub fn session_prefix(self) -> &'static str {
        match self {
            EmbedProfile::Dashboard => "session",
            EmbedProfile::Survey => "survey",
        }
    }
}

/// `<prefix>_<unix millis>_<random suffix>`; the suffix keeps tabs opened in
/// the same millisecond apart.
pub fn mint_session_id(prefix: &str) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(SUFFIX_LEN).collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

/// Origin Gate → Extractor → Noise Filter, wired from one set of capture rules.
#[derive(Debug, Clone)]
pub struct CapturePipeline {
    gate: OriginGate,
    extractor: Extractor,
    filter: NoiseFilter,
    announce_lifecycle: bool,
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default(), false)
    }
}

impl CapturePipeline {
    pub fn from_config(config: &CaptureConfig, announce_lifecycle: bool) -> Self {
        Self {
            gate: OriginGate::new(config.allowed_hosts.iter().cloned()),
            extractor: Extractor::new(config.max_content_chars),
            filter: NoiseFilter::new(config.noise.clone()),
            announce_lifecycle,
        }
    }

    /// Classifies one inbound message into zero or more records for `session_id`.
    pub fn classify(&self, origin: &str, data: Value, session_id: &str) -> Vec<TranscriptRecord> {
        if !self.gate.accepts(origin) {
            return Vec::new();
        }
        let message = IncomingMessage::from(data);
        let mut records: Vec<TranscriptRecord> = self.filter
            .filter_and_tag(self.extractor.extract(&message), session_id)
            .into_iter()
            .collect();
        if self.announce_lifecycle {
            records.extend(self.filter.filter_and_tag(lifecycle_announcement(&message), session_id));
        }
        for record in &mut records {
            record.metadata.insert("origin".to_string(), Value::String(origin.to_string()));
        }
        records
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Saved {
        id: String,
        session_id: String,
    },
    Failed {
        session_id: String,
        error: String,
    },
}

/// One mount of the embed. Owns the session id and the diagnostic counters.
#[derive(Debug)]
pub struct EmbedSession {
    session_id: String,
    profile: EmbedProfile,
    response_id: Option<String>,
    message_count: u64,
    saved_count: u64,
    captured_count: usize,
    recent: VecDeque<Value>,
    transport: TransportSelector,
}

impl EmbedSession {
    pub fn mount(
        profile: EmbedProfile,
        response_id: Option<String>,
        preferred: TransportMode
    ) -> Self {
        let session_id = mint_session_id(profile.session_prefix());
        info!("Starting {:?} embed session: {}", profile, session_id);
        Self {
            session_id,
            profile,
            response_id: response_id.filter(|r| !r.trim().is_empty()),
            message_count: 0,
            saved_count: 0,
            captured_count: 0,
            recent: VecDeque::with_capacity(SUMMARY_WINDOW),
            transport: TransportSelector::new(preferred),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn profile(&self) -> EmbedProfile {
        self.profile
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn saved_count(&self) -> u64 {
        self.saved_count
    }

    pub fn transport(&self) -> TransportMode {
        self.transport.current()
    }

    pub fn mounted_message(&self) -> ServerMessage {
        ServerMessage::Mounted {
            session_id: self.session_id.clone(),
            transport: self.transport.current(),
        }
    }

    /// Runs one forwarded widget message through the pipeline.
    pub fn ingest(
        &mut self,
        pipeline: &CapturePipeline,
        origin: &str,
        data: Value
    ) -> Vec<TranscriptRecord> {
        self.message_count += 1;
        let mut records = pipeline.classify(origin, data, &self.session_id);
        for record in &mut records {
            record.metadata.insert("messageCount".to_string(), json!(self.message_count));
            if self.profile == EmbedProfile::Survey {
                merge_payload_metadata(record);
            }
            self.decorate(record);
        }
        records
    }

    /// Records persisted as soon as the embed mounts.
    pub fn opening_records(&mut self) -> Vec<TranscriptRecord> {
        match self.profile {
            EmbedProfile::Dashboard => Vec::new(),
            EmbedProfile::Survey => {
                let mut record = TranscriptRecord {
                    session_id: self.session_id.clone(),
                    speaker: Speaker::System,
                    content: "Survey session started with avatar integration".to_string(),
                    timestamp: now_iso(),
                    metadata: Default::default(),
                };
                record.metadata.insert("messageType".to_string(), json!("system_event"));
                record.metadata.insert("event".to_string(), json!("survey_session_start"));
                self.decorate(&mut record);
                vec![record]
            }
        }
    }

    fn decorate(&mut self, record: &mut TranscriptRecord) {
        if self.profile == EmbedProfile::Survey {
            record.metadata.insert("source".to_string(), json!("survey_embed"));
            if let Some(response_id) = &self.response_id {
                record.metadata.insert("survey_response_id".to_string(), json!(response_id));
            }
        }
        self.captured_count += 1;
        if self.recent.len() == SUMMARY_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(
            json!({
                "speaker": record.speaker,
                "content": record.content,
                "timestamp": record.timestamp,
            })
        );
    }

    /// Alternative init shapes sent to the widget, since its wire format is not ours.
    pub fn init_probes(&self) -> Vec<Value> {
        let session_id = &self.session_id;
        match self.profile {
            EmbedProfile::Dashboard =>
                vec![
                    json!({"type": "init", "session_id": session_id, "timestamp": now_iso()}),
                    json!({"type": "ready", "session_id": session_id}),
                    json!({"action": "init", "session_id": session_id}),
                    json!({"event": "ready", "session_id": session_id})
                ],
            EmbedProfile::Survey =>
                vec![
                    json!({
                    "type": "init",
                    "session_id": session_id,
                    "timestamp": now_iso(),
                    "source": "survey",
                })
                ],
        }
    }

    /// Rolling summary for the survey host; `None` for the dashboard profile.
    pub fn summary(&self, completed: bool) -> Option<ServerMessage> {
        if self.profile != EmbedProfile::Survey {
            return None;
        }
        let summary = if completed {
            json!({
                "session_id": self.session_id,
                "response_id": self.response_id,
                "session_completed": true,
                "total_messages": self.captured_count,
                "session_end": now_iso(),
            })
        } else {
            json!({
                "session_id": self.session_id,
                "response_id": self.response_id,
                "total_messages": self.captured_count,
                "last_updated": now_iso(),
                "messages": self.recent,
            })
        };
        Some(ServerMessage::Summary { summary })
    }

    /// Turns a persistence result into user notifications, counting saves for this mount only.
    pub fn record_outcome(&mut self, outcome: &PersistOutcome) -> Vec<ServerMessage> {
        match outcome {
            PersistOutcome::Saved { id, session_id } => {
                let mut out = vec![ServerMessage::Notice {
                    level: NoticeLevel::Success,
                    title: "Success".to_string(),
                    description: "Message captured successfully".to_string(),
                }];
                if session_id != &self.session_id {
                    debug!("Save {} belongs to earlier session {}", id, session_id);
                    return out;
                }
                self.saved_count += 1;
                out.push(ServerMessage::RecordSaved {
                    id: id.clone(),
                    session_id: session_id.clone(),
                    message_count: self.message_count,
                    saved_count: self.saved_count,
                });
                out
            }
            PersistOutcome::Failed { session_id, error } => {
                warn!("Failed to save transcript for {}: {}", session_id, error);
                vec![ServerMessage::Notice {
                    level: NoticeLevel::Error,
                    title: "Error".to_string(),
                    description: "Failed to save transcript".to_string(),
                }]
            }
        }
    }

    pub fn widget_status(&mut self, status: WidgetStatus) -> Option<ServerMessage> {
        match status {
            WidgetStatus::Loaded => {
                info!("Widget loaded via {} for {}", self.transport.current(), self.session_id);
                None
            }
            WidgetStatus::LoadFailed =>
                match self.transport.report_failure() {
                    TransportDecision::SwitchTo(mode) => {
                        warn!("Widget failed to load for {}, falling back to {}", self.session_id, mode);
                        Some(ServerMessage::Transport { mode })
                    }
                    TransportDecision::GiveUp => {
                        warn!("Widget failed to load on fallback for {}", self.session_id);
                        Some(ServerMessage::WidgetUnavailable {
                            message: "Error loading AI Avatar. Please refresh the page.".to_string(),
                        })
                    }
                }
        }
    }

    pub fn retry_transport(&mut self) -> ServerMessage {
        let mode = self.transport.reset();
        info!("Retrying preferred transport {} for {}", mode, self.session_id);
        ServerMessage::Transport { mode }
    }
}

/// Copies `data.metadata` from the widget payload onto the record without
/// overwriting keys the pipeline already set.
fn merge_payload_metadata(record: &mut TranscriptRecord) {
    let Some(extra) = record.metadata
        .get("originalData")
        .and_then(|raw| raw.get("data"))
        .and_then(as_container)
        .and_then(|data| data.get("metadata").and_then(Value::as_object).cloned()) else {
        return;
    };
    for (key, value) in extra {
        record.metadata.entry(key).or_insert(value);
    }
}

/// `uninitialized → active`; there is no closed state. `None` is uninitialized.
#[derive(Debug, Default)]
pub struct SessionState {
    current: Option<EmbedSession>,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn active(&self) -> Option<&EmbedSession> {
        self.current.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut EmbedSession> {
        self.current.as_mut()
    }

    /// Replaces any current mount with a fresh one and returns it.
    pub fn mount(&mut self, session: EmbedSession) -> &mut EmbedSession {
        self.current.insert(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://labs.heygen.com";

    fn dashboard() -> EmbedSession {
        EmbedSession::mount(EmbedProfile::Dashboard, None, TransportMode::Sdk)
    }

    #[test]
    fn session_ids_have_prefix_and_do_not_collide() {
        let a = mint_session_id("session");
        let b = mint_session_id("session");
        assert!(a.starts_with("session_"));
        assert_ne!(a, b);
        let parts: Vec<&str> = a.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
    }

    #[test]
    fn sequential_mounts_get_distinct_ids() {
        let first = dashboard();
        let second = dashboard();
        assert_ne!(first.session_id(), second.session_id());
        let survey = EmbedSession::mount(EmbedProfile::Survey, None, TransportMode::Iframe);
        assert!(survey.session_id().starts_with("survey_"));
    }

    #[test]
    fn ingest_counts_and_tags() {
        let pipeline = CapturePipeline::default();
        let mut session = dashboard();
        let records = session.ingest(
            &pipeline,
            ORIGIN,
            json!({"type": "user_message", "data": {"message": "Hello"}})
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id, session.session_id());
        assert_eq!(records[0].speaker, Speaker::User);
        assert_eq!(records[0].metadata["origin"], ORIGIN);
        assert_eq!(records[0].metadata["messageCount"], 1);

        assert!(session.ingest(&pipeline, "https://evil.example", json!("hi")).is_empty());
        assert_eq!(session.message_count(), 2);
    }

    #[test]
    fn lifecycle_announcements_are_opt_in() {
        let payload = json!({"type": "conversation_start"});
        let mut session = dashboard();
        assert!(session.ingest(&CapturePipeline::default(), ORIGIN, payload.clone()).is_empty());

        let announcing = CapturePipeline::from_config(&CaptureConfig::default(), true);
        let records = session.ingest(&announcing, ORIGIN, payload);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].speaker, Speaker::System);
        assert_eq!(records[0].content, "Conversation started (conversation_start)");

        let records = session.ingest(&announcing, ORIGIN, json!({"type": "conversation_ended"}));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "Conversation ended (conversation_ended)");
    }

    #[test]
    fn outcomes_update_saved_count() {
        let mut session = dashboard();
        let id = session.session_id().to_string();
        let out = session.record_outcome(&PersistOutcome::Saved {
            id: "1".into(),
            session_id: id.clone(),
        });
        assert_eq!(session.saved_count(), 1);
        assert!(matches!(out.last(), Some(ServerMessage::RecordSaved { saved_count: 1, .. })));

        let out = session.record_outcome(&PersistOutcome::Failed {
            session_id: id,
            error: "boom".into(),
        });
        assert_eq!(session.saved_count(), 1);
        assert!(
            matches!(&out[..], [ServerMessage::Notice { level: NoticeLevel::Error, .. }])
        );

        let out = session.record_outcome(&PersistOutcome::Saved {
            id: "2".into(),
            session_id: "session_0_stale".into(),
        });
        assert_eq!(session.saved_count(), 1);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn dashboard_probes_carry_session_id() {
        let session = dashboard();
        let probes = session.init_probes();
        assert_eq!(probes.len(), 4);
        for probe in &probes {
            assert_eq!(probe["session_id"], session.session_id());
        }
        assert_eq!(probes[2]["action"], "init");
    }

    #[test]
    fn echoed_probes_are_never_captured() {
        let pipeline = CapturePipeline::default();
        let mut session = dashboard();
        for probe in session.init_probes() {
            let mut echoed = probe.clone();
            echoed["content"] = json!("echo");
            assert!(session.ingest(&pipeline, ORIGIN, echoed).is_empty());
        }
    }

    #[test]
    fn survey_profile_tags_and_summarizes() {
        let pipeline = CapturePipeline::default();
        let mut session = EmbedSession::mount(
            EmbedProfile::Survey,
            Some("R_abc".into()),
            TransportMode::Iframe
        );
        let opening = session.opening_records();
        assert_eq!(opening.len(), 1);
        assert_eq!(opening[0].speaker, Speaker::System);
        assert_eq!(opening[0].metadata["survey_response_id"], "R_abc");

        for i in 0..12 {
            let records = session.ingest(
                &pipeline,
                ORIGIN,
                json!({"type": "avatar_speech", "data": {"content": format!("line {}", i)}})
            );
            assert_eq!(records[0].metadata["source"], "survey_embed");
        }

        let Some(ServerMessage::Summary { summary }) = session.summary(false) else {
            panic!("survey sessions produce summaries");
        };
        assert_eq!(summary["total_messages"], 13);
        let messages = summary["messages"].as_array().unwrap();
        assert_eq!(messages.len(), SUMMARY_WINDOW);
        assert_eq!(messages[SUMMARY_WINDOW - 1]["content"], "line 11");

        let Some(ServerMessage::Summary { summary }) = session.summary(true) else {
            panic!("survey sessions produce final summaries");
        };
        assert_eq!(summary["session_completed"], true);
        assert!(dashboard().summary(false).is_none());
    }

    #[test]
    fn survey_merges_payload_metadata() {
        let pipeline = CapturePipeline::default();
        let payload = json!({
            "type": "user_message",
            "data": {
                "message": "Yes",
                "metadata": {"question_id": "Q3", "source": "widget", "messageType": "spoofed"}
            }
        });

        let mut survey = EmbedSession::mount(EmbedProfile::Survey, None, TransportMode::Sdk);
        let records = survey.ingest(&pipeline, ORIGIN, payload.clone());
        assert_eq!(records[0].metadata["question_id"], "Q3");
        assert_eq!(records[0].metadata["source"], "survey_embed");
        assert_eq!(records[0].metadata["messageType"], "user_message");

        let records = dashboard().ingest(&pipeline, ORIGIN, payload);
        assert!(records[0].metadata.get("question_id").is_none());
    }

    #[test]
    fn load_failures_fall_back_then_give_up() {
        let mut session = dashboard();
        assert!(session.widget_status(WidgetStatus::Loaded).is_none());
        assert_eq!(
            session.widget_status(WidgetStatus::LoadFailed),
            Some(ServerMessage::Transport { mode: TransportMode::Iframe })
        );
        assert!(
            matches!(
                session.widget_status(WidgetStatus::LoadFailed),
                Some(ServerMessage::WidgetUnavailable { .. })
            )
        );
        assert_eq!(session.retry_transport(), ServerMessage::Transport { mode: TransportMode::Sdk });
    }

    #[test]
    fn state_starts_uninitialized_and_remounts() {
        let mut state = SessionState::default();
        assert!(state.active().is_none());
        assert!(!state.is_active());
        let first = state.mount(dashboard()).session_id().to_string();
        let second = state.mount(dashboard()).session_id().to_string();
        assert_ne!(first, second);
        assert!(state.is_active());
        assert_eq!(state.active().unwrap().session_id(), second);
        assert_eq!(state.active().unwrap().message_count(), 0);
    }
}
