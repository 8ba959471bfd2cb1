mod memory;
mod redis;
mod supabase;

pub use memory::MemoryTranscriptStore;
pub use self::redis::RedisTranscriptStore;
pub use supabase::SupabaseTranscriptStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use thiserror::Error;

use crate::cli::Args;
use crate::models::transcript::{
    summarize_sessions,
    SessionSummary,
    StoredTranscript,
    TranscriptQuery,
    TranscriptRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request to transcript store failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transcript store rejected the request ({status}): {body}")]
    Status {
        status: u16,
        body: String,
    },

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Store configuration error: {0}")]
    Config(String),
}

/// Where captured transcript rows end up.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Persists one record, returning the id the store assigned to it.
    async fn insert(&self, record: &TranscriptRecord) -> Result<String, StoreError>;

    /// Rows matching `query`, newest first.
    async fn list(&self, query: &TranscriptQuery) -> Result<Vec<StoredTranscript>, StoreError>;

    async fn sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let rows = self.list(&TranscriptQuery::default()).await?;
        Ok(summarize_sessions(&rows))
    }
}

fn ensure_persistable(record: &TranscriptRecord) -> Result<(), StoreError> {
    if record.is_persistable() {
        Ok(())
    } else {
        Err(StoreError::InvalidRecord("session_id, speaker and content must be non-empty".into()))
    }
}

pub fn create_transcript_store(args: &Args) -> Result<Arc<dyn TranscriptStore>, StoreError> {
    match args.store_type.to_lowercase().as_str() {
        "supabase" => {
            let store = SupabaseTranscriptStore::new(
                &args.store_url,
                args.store_api_key.clone().filter(|k| !k.is_empty()),
                &args.store_table
            )?;
            Ok(Arc::new(store))
        }
        "redis" => {
            let store = RedisTranscriptStore::new(&args.store_url, &args.redis_prefix)?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MemoryTranscriptStore::new())),
        other => Err(StoreError::Config(format!("Unsupported transcript store type: {}", other))),
    }
}

pub fn initialize_transcript_store(args: &Args) -> Result<Arc<dyn TranscriptStore>, StoreError> {
    info!("Transcripts will be stored in: {} at {}", args.store_type, args.store_url);
    create_transcript_store(args)
}
