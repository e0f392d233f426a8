//! Per-key request queue with out-of-order dispatch.
//!
//! One [`RequestQueuer`] exists per API key. Arriving work enters a FIFO;
//! a single cooperative dispatch loop repeatedly picks the earliest
//! *runnable* item — the first whose model's limits allow it now — which
//! means a request for a throttled model never holds up a later request for
//! a model with slack. Ordering within one model is still FIFO, because the
//! first runnable item for that model is always the oldest.

use crate::bucket::UsageBucket;
use crate::estimate::TokenEstimator;
use crate::limiter;
use crate::now_ms;
use crate::store::{self, ModelUsage, UsageStore};
use anyhow::anyhow;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_common::KeyConfig;
use switchboard_llm::traits::LlmResponse;
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;
use uuid::Uuid;

pub type ExecFuture = BoxFuture<'static, anyhow::Result<LlmResponse>>;
pub type ExecFn = Box<dyn FnOnce() -> ExecFuture + Send + Sync>;

/// Smoothing factor for the execution-latency moving average.
const EWMA_ALPHA: f64 = 0.25;
/// Seed for the average before the first sample.
const INITIAL_EXEC_MS: f64 = 500.0;
/// Bounds on the idle sleep between runnable scans.
const MIN_IDLE_SLEEP_MS: i64 = 1;
const MAX_IDLE_SLEEP_MS: i64 = 5_000;

/// Bucket key for items that name no model.
const DEFAULT_BUCKET_KEY: &str = "default";

struct QueueItem {
    id: Uuid,
    execute: ExecFn,
    tokens: u64,
    model: Option<String>,
    reply: oneshot::Sender<anyhow::Result<LlmResponse>>,
}

struct QueueState {
    items: Vec<QueueItem>,
    is_processing: bool,
    estimated_exec_ms: f64,
}

struct QueuerInner {
    config: KeyConfig,
    store: Arc<dyn UsageStore>,
    estimator: Arc<dyn TokenEstimator>,
    state: Mutex<QueueState>,
}

/// Single-key scheduler owning a FIFO, a usage store, and (via the router)
/// one provider client.
#[derive(Clone)]
pub struct RequestQueuer {
    inner: Arc<QueuerInner>,
}

fn bucket_key(model: Option<&str>) -> String {
    model.unwrap_or(DEFAULT_BUCKET_KEY).to_string()
}

impl RequestQueuer {
    pub fn new(
        config: KeyConfig,
        store: Arc<dyn UsageStore>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        Self {
            inner: Arc::new(QueuerInner {
                config,
                store,
                estimator,
                state: Mutex::new(QueueState {
                    items: Vec::new(),
                    is_processing: false,
                    estimated_exec_ms: INITIAL_EXEC_MS,
                }),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    pub fn config(&self) -> &KeyConfig {
        &self.inner.config
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    pub async fn is_processing(&self) -> bool {
        self.inner.state.lock().await.is_processing
    }

    /// Submit work. Resolves with the outcome of `execute` once the item has
    /// been dispatched; provider errors come back unchanged.
    ///
    /// When the key carries no limits for `model` and no fallback delay, the
    /// queuer is transparent: `execute` runs immediately, nothing is
    /// enqueued, and no usage is tracked.
    pub async fn add(
        &self,
        execute: ExecFn,
        token_text: Option<&str>,
        model: Option<&str>,
    ) -> anyhow::Result<LlmResponse> {
        let tokens = token_text
            .map(|text| self.inner.estimator.estimate(text))
            .unwrap_or(0);

        if !self.inner.config.has_limits_for(model)
            && self.inner.config.fallback_delay_ms.is_none()
        {
            return execute().await;
        }

        let (reply, outcome) = oneshot::channel();
        let item = QueueItem {
            id: Uuid::new_v4(),
            execute,
            tokens,
            model: model.map(str::to_string),
            reply,
        };

        {
            let mut state = self.inner.state.lock().await;
            tracing::debug!(
                label = %self.inner.config.label,
                item = %item.id,
                model = model.unwrap_or(DEFAULT_BUCKET_KEY),
                tokens,
                depth = state.items.len(),
                "queue.enqueue"
            );
            state.items.push(item);
            if !state.is_processing {
                state.is_processing = true;
                tokio::spawn(dispatch_loop(self.inner.clone()));
            }
        }

        outcome
            .await
            .map_err(|_| anyhow!("queue dropped the request"))?
    }

    /// Best-effort milliseconds until a hypothetical request for `model`
    /// sized `tokens_needed` would start executing, assuming it joined the
    /// tail of the queue right now.
    ///
    /// The whole current queue is replayed against deep copies of the usage
    /// buckets, using the observed execution-latency average as each item's
    /// duration. The live store is never touched.
    pub async fn estimate_wait_ms(&self, model: Option<&str>, tokens_needed: u64) -> i64 {
        struct SimItem {
            tokens: u64,
            model: Option<String>,
            hypothetical: bool,
        }

        let real_now = now_ms();
        let mut sandbox: HashMap<String, UsageBucket> =
            self.inner.store.entries().await.into_iter().collect();

        let (mut pending, exec_ms) = {
            let state = self.inner.state.lock().await;
            let pending: Vec<SimItem> = state
                .items
                .iter()
                .map(|item| SimItem {
                    tokens: item.tokens,
                    model: item.model.clone(),
                    hypothetical: false,
                })
                .collect();
            (pending, state.estimated_exec_ms)
        };
        pending.push(SimItem {
            tokens: tokens_needed,
            model: model.map(str::to_string),
            hypothetical: true,
        });

        let mut sim_now = real_now;
        loop {
            let mut min_wait = i64::MAX;
            let mut runnable: Option<usize> = None;

            for (idx, item) in pending.iter().enumerate() {
                let key = bucket_key(item.model.as_deref());
                let bucket = sandbox
                    .entry(key)
                    .or_insert_with(|| UsageBucket::fresh(sim_now));
                let limits = self.inner.config.active_limits(item.model.as_deref());
                let wait = limiter::wait_ms(bucket, &limits, sim_now, item.tokens);
                if wait == 0 {
                    runnable = Some(idx);
                    break;
                }
                min_wait = min_wait.min(wait);
            }

            match runnable {
                Some(idx) => {
                    let item = pending.remove(idx);
                    if item.hypothetical {
                        return sim_now - real_now;
                    }
                    let completion = sim_now + exec_ms.round() as i64;
                    let key = bucket_key(item.model.as_deref());
                    let bucket = sandbox
                        .entry(key)
                        .or_insert_with(|| UsageBucket::fresh(completion));
                    limiter::record(bucket, completion, item.tokens);
                    sim_now = completion;
                    if let Some(delay) = self.inner.config.fallback_delay_ms {
                        if !pending.is_empty() {
                            sim_now += delay as i64;
                        }
                    }
                }
                None => {
                    sim_now += min_wait.clamp(MIN_IDLE_SLEEP_MS, MAX_IDLE_SLEEP_MS);
                }
            }
        }
    }

    /// Maintained per-model usage for this queue.
    pub async fn usage_snapshot(&self) -> BTreeMap<String, ModelUsage> {
        store::snapshot(self.inner.store.as_ref(), now_ms()).await
    }

    /// Release the underlying store's background resources. In-flight
    /// dispatches run to completion.
    pub async fn dispose(&self) {
        self.inner.store.dispose().await;
    }
}

enum Decision {
    Idle,
    Sleep(i64),
    Run(QueueItem),
}

async fn dispatch_loop(inner: Arc<QueuerInner>) {
    loop {
        let now = now_ms();

        let decision = {
            let mut state = inner.state.lock().await;
            if state.items.is_empty() {
                state.is_processing = false;
                Decision::Idle
            } else {
                let mut min_wait = i64::MAX;
                let mut runnable: Option<usize> = None;

                for (idx, item) in state.items.iter().enumerate() {
                    let key = bucket_key(item.model.as_deref());
                    let mut bucket = inner.store.get(&key).await;
                    let limits = inner.config.active_limits(item.model.as_deref());
                    let wait = limiter::wait_ms(&mut bucket, &limits, now, item.tokens);
                    if wait == 0 {
                        runnable = Some(idx);
                        break;
                    }
                    min_wait = min_wait.min(wait);
                }

                match runnable {
                    Some(idx) => Decision::Run(state.items.remove(idx)),
                    None => Decision::Sleep(min_wait.clamp(MIN_IDLE_SLEEP_MS, MAX_IDLE_SLEEP_MS)),
                }
            }
        };

        match decision {
            Decision::Idle => return,
            Decision::Sleep(ms) => {
                tracing::trace!(
                    label = %inner.config.label,
                    sleep_ms = ms,
                    "queue.dispatch.throttled"
                );
                sleep(Duration::from_millis(ms as u64)).await;
            }
            Decision::Run(item) => {
                tracing::debug!(
                    label = %inner.config.label,
                    item = %item.id,
                    "queue.dispatch.select"
                );

                let started = Instant::now();
                let result = (item.execute)().await;
                let elapsed_ms = started.elapsed().as_millis() as f64;
                let completion = now_ms();

                if result.is_ok() {
                    let key = bucket_key(item.model.as_deref());
                    let mut bucket = inner.store.get(&key).await;
                    limiter::record(&mut bucket, completion, item.tokens);
                    inner.store.set(&key, bucket).await;

                    let persister = inner.store.clone();
                    tokio::spawn(async move {
                        persister.persist(now_ms()).await;
                    });
                } else {
                    tracing::warn!(
                        label = %inner.config.label,
                        item = %item.id,
                        "queue.dispatch.failed"
                    );
                }

                let _ = item.reply.send(result);

                let fallback = {
                    let mut state = inner.state.lock().await;
                    state.estimated_exec_ms =
                        EWMA_ALPHA * elapsed_ms + (1.0 - EWMA_ALPHA) * state.estimated_exec_ms;
                    inner
                        .config
                        .fallback_delay_ms
                        .filter(|_| !state.items.is_empty())
                };
                if let Some(delay) = fallback {
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
}
