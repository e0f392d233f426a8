//! Record-store-backed usage persistence.
//!
//! Buckets live in memory exactly as with [`crate::store::MemoryUsageStore`];
//! a background task periodically flushes the dirty subset to a remote
//! record collection (PocketBase-style REST API) so that counters survive a
//! process restart. Persistence is strictly best-effort: every failure is
//! logged and swallowed, the dirty flag stays set, and dispatch never waits
//! on a flush.

use crate::bucket::UsageBucket;
use crate::now_ms;
use crate::store::{UsageStore, UsageStoreFactory};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(15);
const BOOTSTRAP_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone)]
pub struct RemoteStoreSettings {
    pub base_url: String,
    pub identity: String,
    pub password: String,
    /// Collection holding one record per namespaced model key.
    pub collection: String,
    pub flush_interval: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum RemoteStoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("record store error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication rejected")]
    Auth,

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct RecordList {
    #[serde(default)]
    items: Vec<UsageRecord>,
}

#[derive(Deserialize)]
struct UsageRecord {
    id: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    usage: serde_json::Value,
}

/// Usage store that shares a record collection with other queues by
/// namespacing keys as `"<label>::<model_key>"`.
pub struct RemoteUsageStore {
    http: reqwest::Client,
    settings: RemoteStoreSettings,
    label: Option<String>,
    buckets: DashMap<String, UsageBucket>,
    record_ids: DashMap<String, String>,
    dirty: Mutex<HashSet<String>>,
    token: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl RemoteUsageStore {
    /// Build the store, seed it from the remote collection, and start the
    /// periodic flush task. Bootstrap failures are logged, not fatal: the
    /// queue starts with empty history rather than refusing to serve.
    pub async fn connect(settings: RemoteStoreSettings, label: Option<String>) -> Arc<Self> {
        let store = Arc::new(Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            settings,
            label,
            buckets: DashMap::new(),
            record_ids: DashMap::new(),
            dirty: Mutex::new(HashSet::new()),
            token: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        if let Err(err) = store.bootstrap().await {
            tracing::warn!(error = %err, "usage.bootstrap.error");
        }

        let flusher = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flusher.settings.flush_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = flusher.cancel.cancelled() => break,
                    _ = ticker.tick() => flusher.persist_dirty().await,
                }
            }
        });

        store
    }

    fn namespaced(&self, model_key: &str) -> String {
        match &self.label {
            Some(label) => format!("{label}::{model_key}"),
            None => model_key.to_string(),
        }
    }

    fn strip_namespace<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        match &self.label {
            Some(label) => full_key
                .strip_prefix(label.as_str())
                .and_then(|rest| rest.strip_prefix("::")),
            None => Some(full_key),
        }
    }

    async fn auth_token(&self) -> Result<String, RemoteStoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = format!(
            "{}/api/collections/users/auth-with-password",
            self.settings.base_url
        );
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "identity": self.settings.identity,
                "password": self.settings.password,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RemoteStoreError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let auth: AuthResponse = resp.json().await?;
        *cached = Some(auth.token.clone());
        Ok(auth.token)
    }

    async fn bootstrap(&self) -> Result<(), RemoteStoreError> {
        let token = self.auth_token().await?;
        let url = format!(
            "{}/api/collections/{}/records",
            self.settings.base_url, self.settings.collection
        );
        let resp = self
            .http
            .get(&url)
            .header("Authorization", token)
            .query(&[("perPage", BOOTSTRAP_PAGE_SIZE.to_string())])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RemoteStoreError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let list: RecordList = resp.json().await?;
        let now = now_ms();
        let mut restored = 0usize;

        for record in list.items {
            let Some(model_key) = self.strip_namespace(&record.key) else {
                continue;
            };
            let mut bucket = parse_usage_value(&record.usage);
            bucket.normalize(now);
            self.record_ids
                .insert(record.key.clone(), record.id.clone());
            self.buckets.insert(model_key.to_string(), bucket);
            restored += 1;
        }

        tracing::info!(
            restored,
            label = self.label.as_deref().unwrap_or("-"),
            "usage.bootstrap.loaded"
        );
        Ok(())
    }

    async fn persist_dirty(&self) {
        let pending: Vec<String> = {
            let mut dirty = self.dirty.lock().await;
            dirty.drain().collect()
        };
        if pending.is_empty() {
            return;
        }

        let token = match self.auth_token().await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(error = %err, "usage.persist.auth_error");
                self.mark_dirty(pending).await;
                return;
            }
        };

        for model_key in pending {
            let Some(bucket) = self.buckets.get(&model_key).map(|b| b.clone()) else {
                continue;
            };
            if let Err(err) = self.write_record(&token, &model_key, &bucket).await {
                if matches!(err, RemoteStoreError::Auth) {
                    self.token.lock().await.take();
                }
                tracing::warn!(%model_key, error = %err, "usage.persist.error");
                self.mark_dirty(vec![model_key]).await;
            }
        }
    }

    async fn mark_dirty(&self, keys: Vec<String>) {
        let mut dirty = self.dirty.lock().await;
        dirty.extend(keys);
    }

    async fn write_record(
        &self,
        token: &str,
        model_key: &str,
        bucket: &UsageBucket,
    ) -> Result<(), RemoteStoreError> {
        let full_key = self.namespaced(model_key);
        let body = json!({
            "key": full_key,
            "usage": serde_json::to_value(bucket)?,
        });

        if let Some(record_id) = self.record_ids.get(&full_key).map(|r| r.clone()) {
            let url = format!(
                "{}/api/collections/{}/records/{}",
                self.settings.base_url, self.settings.collection, record_id
            );
            let resp = self
                .http
                .patch(&url)
                .header("Authorization", token)
                .json(&body)
                .send()
                .await?;

            if resp.status().is_success() {
                return Ok(());
            }
            if is_auth_status(resp.status().as_u16()) {
                return Err(RemoteStoreError::Auth);
            }
            // The record may have been deleted out from under us; fall
            // through and recreate it.
            tracing::debug!(
                %full_key,
                status = resp.status().as_u16(),
                "usage.persist.update_failed"
            );
            self.record_ids.remove(&full_key);
        }

        let url = format!(
            "{}/api/collections/{}/records",
            self.settings.base_url, self.settings.collection
        );
        let resp = self
            .http
            .post(&url)
            .header("Authorization", token)
            .json(&body)
            .send()
            .await?;

        if is_auth_status(resp.status().as_u16()) {
            return Err(RemoteStoreError::Auth);
        }
        if !resp.status().is_success() {
            return Err(RemoteStoreError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let created: UsageRecord = resp.json().await?;
        self.record_ids.insert(full_key, created.id);
        Ok(())
    }
}

fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

/// Stored usage may be a JSON object or a JSON-encoded string of one;
/// anything unreadable degrades to a zeroed bucket.
fn parse_usage_value(value: &serde_json::Value) -> UsageBucket {
    let parsed = match value {
        serde_json::Value::String(raw) => serde_json::from_str(raw).ok(),
        other => serde_json::from_value(other.clone()).ok(),
    };
    parsed.unwrap_or_default()
}

#[async_trait]
impl UsageStore for RemoteUsageStore {
    async fn get(&self, model_key: &str) -> UsageBucket {
        self.buckets
            .entry(model_key.to_string())
            .or_insert_with(|| UsageBucket::fresh(now_ms()))
            .clone()
    }

    async fn set(&self, model_key: &str, bucket: UsageBucket) {
        self.buckets.insert(model_key.to_string(), bucket);
        self.mark_dirty(vec![model_key.to_string()]).await;
    }

    async fn entries(&self) -> Vec<(String, UsageBucket)> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    async fn persist(&self, _now: i64) {
        self.persist_dirty().await;
    }

    async fn dispose(&self) {
        self.cancel.cancel();
        self.persist_dirty().await;
    }
}

/// Factory for the record-store backend; one store (and one flush task) per
/// queue label.
pub struct RemoteStoreFactory {
    pub settings: RemoteStoreSettings,
}

#[async_trait]
impl UsageStoreFactory for RemoteStoreFactory {
    async fn build(&self, label: &str) -> Arc<dyn UsageStore> {
        RemoteUsageStore::connect(self.settings.clone(), Some(label.to_string())).await
    }
}
