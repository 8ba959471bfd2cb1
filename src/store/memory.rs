use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ ensure_persistable, StoreError, TranscriptStore };
use crate::capture::filter::now_iso;
use crate::models::transcript::{ StoredTranscript, TranscriptQuery, TranscriptRecord };

/// In-process store; rows are kept newest first.
#[derive(Default)]
pub struct MemoryTranscriptStore {
    rows: RwLock<Vec<StoredTranscript>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn insert(&self, record: &TranscriptRecord) -> Result<String, StoreError> {
        ensure_persistable(record)?;
        let id = Uuid::new_v4().to_string();
        let row = StoredTranscript {
            id: id.clone(),
            created_at: now_iso(),
            record: record.clone(),
        };
        self.rows.write().await.insert(0, row);
        Ok(id)
    }

    async fn list(&self, query: &TranscriptQuery) -> Result<Vec<StoredTranscript>, StoreError> {
        let rows = self.rows.read().await.clone();
        Ok(query.apply(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transcript::Speaker;

    fn record(session: &str, content: &str) -> TranscriptRecord {
        TranscriptRecord {
            session_id: session.to_string(),
            speaker: Speaker::User,
            content: content.to_string(),
            timestamp: now_iso(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn insert_then_list_newest_first() {
        let store = MemoryTranscriptStore::new();
        let first = store.insert(&record("a", "one")).await.unwrap();
        let second = store.insert(&record("a", "two")).await.unwrap();
        assert_ne!(first, second);

        let rows = store.list(&TranscriptQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, second);
        assert_eq!(rows[1].record.content, "one");
    }

    #[tokio::test]
    async fn rejects_unpersistable_records() {
        let store = MemoryTranscriptStore::new();
        let err = store.insert(&record("a", "   ")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
        let err = store.insert(&record("", "text")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn sessions_are_summarized() {
        let store = MemoryTranscriptStore::new();
        store.insert(&record("a", "x")).await.unwrap();
        store.insert(&record("b", "y")).await.unwrap();
        store.insert(&record("a", "z")).await.unwrap();
        let sessions = store.sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        let a = sessions.iter().find(|s| s.session_id == "a").unwrap();
        assert_eq!(a.message_count, 2);
    }
}
