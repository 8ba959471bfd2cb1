use log::{ error, info };
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::capture::session::{ CapturePipeline, EmbedProfile, EmbedSession, PersistOutcome };
use crate::capture::transport::TransportMode;
use crate::cli::Args;
use crate::config::capture::CaptureConfig;
use crate::models::transcript::TranscriptRecord;
use crate::models::websocket::ServerMessage;
use crate::store::TranscriptStore;

#[derive(Debug, Clone)]
pub struct ProbeSchedule {
    pub target_origin: String,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        Self {
            target_origin: "https://labs.heygen.com".to_string(),
            initial_delay: Duration::from_millis(2000),
            interval: Duration::from_millis(1000),
        }
    }
}

/// Everything a connection needs to capture: the pipeline, the store and mount settings.
#[derive(Clone)]
pub struct CaptureService {
    pipeline: Arc<CapturePipeline>,
    store: Arc<dyn TranscriptStore>,
    preferred_transport: TransportMode,
    probes: ProbeSchedule,
}

impl CaptureService {
    pub fn new(
        config: &CaptureConfig,
        store: Arc<dyn TranscriptStore>,
        announce_lifecycle: bool
    ) -> Self {
        Self {
            pipeline: Arc::new(CapturePipeline::from_config(config, announce_lifecycle)),
            store,
            preferred_transport: TransportMode::Sdk,
            probes: ProbeSchedule::default(),
        }
    }

    pub fn from_args(
        args: &Args,
        config: &CaptureConfig,
        store: Arc<dyn TranscriptStore>
    ) -> Self {
        Self::new(config, store, args.announce_lifecycle)
            .with_transport(args.widget_transport)
            .with_probes(ProbeSchedule {
                target_origin: args.widget_origin.clone(),
                initial_delay: Duration::from_millis(args.probe_delay_ms),
                interval: Duration::from_millis(args.probe_interval_ms),
            })
    }

    pub fn with_transport(mut self, preferred: TransportMode) -> Self {
        self.preferred_transport = preferred;
        self
    }

    pub fn with_probes(mut self, probes: ProbeSchedule) -> Self {
        self.probes = probes;
        self
    }

    pub fn pipeline(&self) -> &CapturePipeline {
        &self.pipeline
    }

    pub fn store(&self) -> Arc<dyn TranscriptStore> {
        Arc::clone(&self.store)
    }

    pub fn mount(&self, profile: EmbedProfile, response_id: Option<String>) -> EmbedSession {
        EmbedSession::mount(profile, response_id, self.preferred_transport)
    }

    /// Feeds one widget message to the mount and returns the records to persist.
    pub fn ingest(&self, session: &mut EmbedSession, origin: &str, data: Value) -> Vec<TranscriptRecord> {
        session.ingest(&self.pipeline, origin, data)
    }

    /// Fire-and-forget insert; the outcome comes back on `outcomes`.
    pub fn dispatch(&self, record: TranscriptRecord, outcomes: UnboundedSender<PersistOutcome>) {
        let store = self.store();
        tokio::spawn(async move {
            let outcome = persist(store.as_ref(), &record).await;
            if outcomes.send(outcome).is_err() {
                info!("Connection for {} closed before its save completed", record.session_id);
            }
        });
    }

    /// Sends the mount's init probes through `out`, staggered. Abort the handle to cancel.
    pub fn schedule_probes(
        &self,
        session: &EmbedSession,
        out: UnboundedSender<ServerMessage>
    ) -> JoinHandle<()> {
        let probes = session.init_probes();
        let schedule = self.probes.clone();
        let session_id = session.session_id().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(schedule.initial_delay).await;
            for (index, payload) in probes.into_iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(schedule.interval).await;
                }
                let probe = ServerMessage::Probe {
                    target_origin: schedule.target_origin.clone(),
                    payload,
                };
                if out.send(probe).is_err() {
                    return;
                }
            }
            info!("Sent init probes for session {}", session_id);
        })
    }
}

pub async fn persist(store: &dyn TranscriptStore, record: &TranscriptRecord) -> PersistOutcome {
    match store.insert(record).await {
        Ok(id) => {
            info!(
                "Saved transcript {} - {}: {}",
                id,
                record.speaker,
                record.content.chars().take(50).collect::<String>()
            );
            PersistOutcome::Saved { id, session_id: record.session_id.clone() }
        }
        Err(e) => {
            error!("Error saving transcript: {}", e);
            PersistOutcome::Failed { session_id: record.session_id.clone(), error: e.to_string() }
        }
    }
}
