//! Usage-bucket storage.
//!
//! A [`UsageStore`] maps model keys to [`UsageBucket`]s. The in-memory
//! backend here is the default; [`crate::remote::RemoteUsageStore`] adds
//! periodic persistence to a record store so counters survive restarts.

use crate::bucket::UsageBucket;
use crate::limiter;
use crate::now_ms;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Mapping from model key to usage bucket, owned by exactly one queuer.
///
/// `entries` must tolerate concurrent `get`/`set` calls from other tasks;
/// `persist` is best-effort and never blocks dispatch.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Fetch the bucket for `model_key`, creating a zeroed one on miss.
    async fn get(&self, model_key: &str) -> UsageBucket;

    async fn set(&self, model_key: &str, bucket: UsageBucket);

    /// Snapshot of all buckets, in unspecified order.
    async fn entries(&self) -> Vec<(String, UsageBucket)>;

    /// Flush changed buckets to the backing medium, if any.
    async fn persist(&self, now: i64);

    /// Release background resources. The store must not be used afterwards.
    async fn dispose(&self);
}

/// Volatile in-process backend.
#[derive(Default)]
pub struct MemoryUsageStore {
    buckets: DashMap<String, UsageBucket>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn UsageStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get(&self, model_key: &str) -> UsageBucket {
        self.buckets
            .entry(model_key.to_string())
            .or_insert_with(|| UsageBucket::fresh(now_ms()))
            .clone()
    }

    async fn set(&self, model_key: &str, bucket: UsageBucket) {
        self.buckets.insert(model_key.to_string(), bucket);
    }

    async fn entries(&self) -> Vec<(String, UsageBucket)> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    async fn persist(&self, _now: i64) {}

    async fn dispose(&self) {}
}

/// Point-in-time usage view for one model key, after a maintenance pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub requests_last_second: usize,
    pub requests_last_minute: usize,
    pub requests_last_day: usize,
    pub minute_tokens: u64,
    pub minute_window_start: i64,
    pub month: MonthUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthUsage {
    pub tokens: MonthCounter,
    pub requests: MonthCounter,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthCounter {
    pub count: u64,
    pub reset_at: i64,
    pub reset_in_ms: i64,
}

impl ModelUsage {
    pub fn from_bucket(bucket: &UsageBucket, now: i64) -> Self {
        Self {
            requests_last_second: bucket.second_ts.len(),
            requests_last_minute: bucket.minute_ts.len(),
            requests_last_day: bucket.day_ts.len(),
            minute_tokens: bucket.minute_token_count,
            minute_window_start: bucket.minute_token_window_start,
            month: MonthUsage {
                tokens: MonthCounter {
                    count: bucket.month_token_count,
                    reset_at: bucket.month_token_reset_at,
                    reset_in_ms: (bucket.month_token_reset_at - now).max(0),
                },
                requests: MonthCounter {
                    count: bucket.month_request_count,
                    reset_at: bucket.month_request_reset_at,
                    reset_in_ms: (bucket.month_request_reset_at - now).max(0),
                },
            },
        }
    }
}

/// Maintained per-model usage across a whole store.
pub async fn snapshot(store: &dyn UsageStore, now: i64) -> BTreeMap<String, ModelUsage> {
    store
        .entries()
        .await
        .into_iter()
        .map(|(key, mut bucket)| {
            limiter::maintain(&mut bucket, now);
            (key, ModelUsage::from_bucket(&bucket, now))
        })
        .collect()
}

/// Builds the usage store for a queue at registration time.
#[async_trait]
pub trait UsageStoreFactory: Send + Sync {
    async fn build(&self, label: &str) -> Arc<dyn UsageStore>;
}

/// Factory for the volatile backend.
pub struct MemoryStoreFactory;

#[async_trait]
impl UsageStoreFactory for MemoryStoreFactory {
    async fn build(&self, _label: &str) -> Arc<dyn UsageStore> {
        MemoryUsageStore::shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::MINUTE_MS;

    #[tokio::test]
    async fn miss_creates_fresh_bucket_with_anchors() {
        let store = MemoryUsageStore::new();
        let bucket = store.get("mistral-small-latest").await;
        assert!(bucket.second_ts.is_empty());
        assert!(bucket.month_request_reset_at > now_ms());
        assert!(bucket.minute_token_window_start <= now_ms());
    }

    #[tokio::test]
    async fn set_then_entries_round_trips() {
        let store = MemoryUsageStore::new();
        let mut bucket = store.get("m").await;
        bucket.month_request_count = 7;
        store.set("m", bucket).await;

        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "m");
        assert_eq!(entries[0].1.month_request_count, 7);
    }

    #[tokio::test]
    async fn snapshot_applies_maintenance() {
        let store = MemoryUsageStore::new();
        let now = now_ms();
        let mut bucket = UsageBucket::fresh(now - MINUTE_MS * 2);
        bucket.second_ts = vec![now - MINUTE_MS * 2];
        bucket.minute_token_count = 50;
        store.set("m", bucket).await;

        let view = snapshot(&store, now).await;
        let usage = &view["m"];
        assert_eq!(usage.requests_last_second, 0, "stale entries are pruned");
        assert_eq!(usage.minute_tokens, 0, "stale token window is reset");
        assert_eq!(usage.month.requests.count, 0);
    }
}
