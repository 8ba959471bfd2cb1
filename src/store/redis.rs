use async_trait::async_trait;
use ::redis::{ AsyncCommands, Client };
use log::error;

use super::{ ensure_persistable, StoreError, TranscriptStore };
use crate::capture::filter::now_iso;
use crate::models::transcript::{ StoredTranscript, TranscriptQuery, TranscriptRecord };

/// Rows are JSON entries LPUSHed onto a global list and a per-session list,
/// so both read back newest first.
pub struct RedisTranscriptStore {
    client: Client,
    key_prefix: String,
}

impl RedisTranscriptStore {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<::redis::aio::MultiplexedConnection, ::redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn all_key(&self) -> String {
        format!("{}all", self.key_prefix)
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}session:{}", self.key_prefix, session_id)
    }

    fn seq_key(&self) -> String {
        format!("{}seq", self.key_prefix)
    }
}

#[async_trait]
impl TranscriptStore for RedisTranscriptStore {
    async fn insert(&self, record: &TranscriptRecord) -> Result<String, StoreError> {
        ensure_persistable(record)?;
        let mut conn = self.get_connection().await?;
        let seq: i64 = conn.incr(self.seq_key(), 1).await?;
        let row = StoredTranscript {
            id: seq.to_string(),
            created_at: now_iso(),
            record: record.clone(),
        };
        let json_row = serde_json::to_string(&row)?;

        let _: i64 = conn.lpush(self.all_key(), &json_row).await?;
        let _: i64 = conn.lpush(self.session_key(&record.session_id), &json_row).await?;
        Ok(row.id)
    }

    async fn list(&self, query: &TranscriptQuery) -> Result<Vec<StoredTranscript>, StoreError> {
        let mut conn = self.get_connection().await?;
        let key = match query.session_id.as_deref().filter(|s| !s.is_empty()) {
            Some(session_id) => self.session_key(session_id),
            None => self.all_key(),
        };
        let json_entries: Vec<String> = conn.lrange(&key, 0, -1).await?;

        let mut rows = Vec::with_capacity(json_entries.len());
        for json_entry in &json_entries {
            match serde_json::from_str::<StoredTranscript>(json_entry) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    error!("Error parsing stored transcript entry: {}", e);
                }
            }
        }
        Ok(query.apply(rows))
    }
}
