use async_trait::async_trait;
use log::{ debug, error };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE } };
use serde_json::Value;

use super::{ ensure_persistable, StoreError, TranscriptStore };
use crate::models::transcript::{ StoredTranscript, TranscriptQuery, TranscriptRecord };

/// Table store reached through a PostgREST endpoint (`/rest/v1/<table>`).
pub struct SupabaseTranscriptStore {
    http: HttpClient,
    endpoint: String,
}

impl SupabaseTranscriptStore {
    pub fn new(base_url: &str, api_key: Option<String>, table: &str) -> Result<Self, StoreError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(StoreError::Config("store URL is required for the supabase store".into()));
        }
        if table.trim().is_empty() {
            return Err(StoreError::Config("table name is required for the supabase store".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let invalid = |_| StoreError::Config("store API key is not a valid header value".into());
            headers.insert("apikey", HeaderValue::from_str(&key).map_err(invalid)?);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?
            );
        }
        let http = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/rest/v1/{}", base_url, table.trim()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// PostgREST filter parameters for a listing query.
fn query_params(query: &TranscriptQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![("select", "*".to_string()), ("order", "created_at.desc".to_string())];
    if let Some(session_id) = query.session_id.as_deref().filter(|s| !s.is_empty()) {
        params.push(("session_id", format!("eq.{}", session_id)));
    }
    if let Some(term) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let term: String = term.chars().filter(|c| *c != '*').collect();
        params.push(("content", format!("ilike.*{}*", term)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

fn row_from_value(mut value: Value) -> Result<StoredTranscript, StoreError> {
    let id = match value.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
            return Err(StoreError::InvalidRecord("stored row has no id".into()));
        }
    };
    let created_at = value
        .get("created_at")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if value.get("metadata").map_or(false, Value::is_null) {
        value["metadata"] = Value::Object(Default::default());
    }
    let record: TranscriptRecord = serde_json::from_value(value)?;
    Ok(StoredTranscript { id, created_at, record })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("Transcript store returned {}: {}", status, body);
    Err(StoreError::Status { status: status.as_u16(), body })
}

#[async_trait]
impl TranscriptStore for SupabaseTranscriptStore {
    async fn insert(&self, record: &TranscriptRecord) -> Result<String, StoreError> {
        ensure_persistable(record)?;
        debug!("Inserting transcript for session {}", record.session_id);
        let response = self.http
            .post(&self.endpoint)
            .header("Prefer", "return=representation")
            .json(record)
            .send().await?;
        let rows: Vec<Value> = check_status(response).await?.json().await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidRecord("store returned no inserted row".into()))?;
        Ok(row_from_value(row)?.id)
    }

    async fn list(&self, query: &TranscriptQuery) -> Result<Vec<StoredTranscript>, StoreError> {
        let response = self.http.get(&self.endpoint).query(&query_params(query)).send().await?;
        let rows: Vec<Value> = check_status(response).await?.json().await?;
        rows.into_iter().map(row_from_value).collect()
    }
}
