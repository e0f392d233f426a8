//! Provider-aware routing across queuers.
//!
//! The router owns every queuer/client pair, registered per provider. Each
//! incoming request names one or more `(provider, model)` candidates; the
//! router asks every queuer of every candidate provider how long the
//! request would wait there and hands the work to the minimum. Ties break
//! in first-seen order, so routing is deterministic for identical states.

use crate::estimate::TokenEstimator;
use crate::queue::{ExecFn, RequestQueuer};
use crate::store::{ModelUsage, UsageStoreFactory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use switchboard_common::{ChatMessage, DEFAULT_MODEL_KEY};
use switchboard_keys::{KeyError, KeyResolver};
use switchboard_llm::build_client;
use switchboard_llm::traits::{LlmClient, LlmError, LlmResponse};
use tokio::sync::RwLock;

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("no available provider for requested targets")]
    NoAvailableProvider,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("key reload is not supported by the configured resolver")]
    ReloadUnsupported,

    #[error("key resolution failed: {0}")]
    Keys(#[from] KeyError),

    #[error("client construction failed: {0}")]
    Client(#[from] LlmError),

    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// One `(provider, model)` routing candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetRef {
    #[serde(default)]
    pub provider: Option<String>,
    pub model: String,
}

/// Client-supplied target specification: a bare model name, one reference,
/// or a list of references tried as alternatives.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Name(String),
    One(TargetRef),
    Many(Vec<TargetRef>),
}

#[derive(Clone)]
struct QueuerSlot {
    queuer: RequestQueuer,
    client: Arc<dyn LlmClient + Send + Sync>,
}

/// A brokered response, enriched with the target that actually served it.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedResponse {
    pub response: LlmResponse,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub label: String,
    pub queue_length: usize,
    pub processing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUsage {
    pub label: String,
    pub models: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub requests_last_second: usize,
    pub requests_last_minute: usize,
    pub requests_last_day: usize,
    pub month_requests: u64,
    pub month_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub providers: BTreeMap<String, Vec<QueueUsage>>,
    pub totals: UsageTotals,
}

pub struct Router {
    providers: RwLock<HashMap<String, Vec<QueuerSlot>>>,
    resolver: Arc<dyn KeyResolver>,
    store_factory: Arc<dyn UsageStoreFactory>,
    estimator: Arc<dyn TokenEstimator>,
    default_provider: String,
}

impl Router {
    pub fn new(
        resolver: Arc<dyn KeyResolver>,
        store_factory: Arc<dyn UsageStoreFactory>,
        estimator: Arc<dyn TokenEstimator>,
        default_provider: impl Into<String>,
    ) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            resolver,
            store_factory,
            estimator,
            default_provider: default_provider.into(),
        }
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Install queuer/client pairs for `provider`, disposing any previous
    /// generation. In-flight dispatches on replaced queuers run to
    /// completion against their old clients.
    pub async fn register_provider(
        &self,
        provider: &str,
        pairs: Vec<(RequestQueuer, Arc<dyn LlmClient + Send + Sync>)>,
    ) {
        let slots: Vec<QueuerSlot> = pairs
            .into_iter()
            .map(|(queuer, client)| QueuerSlot { queuer, client })
            .collect();
        let count = slots.len();

        let replaced = {
            let mut providers = self.providers.write().await;
            providers.insert(provider.to_string(), slots)
        };
        if let Some(old) = replaced {
            for slot in old {
                slot.queuer.dispose().await;
            }
        }

        tracing::info!(provider, keys = count, "router.provider.loaded");
    }

    /// Resolve keys for `provider` and install fresh queuer/client pairs.
    /// Returns the number of keys now serving the provider.
    pub async fn load_provider(&self, provider: &str) -> Result<usize, RouterError> {
        let configs = self.resolver.resolve(provider).await?;
        let mut pairs = Vec::with_capacity(configs.len());
        for config in configs {
            let client = build_client(provider, config.key.clone())?;
            let store = self.store_factory.build(&config.label).await;
            let queuer = RequestQueuer::new(config, store, self.estimator.clone());
            pairs.push((queuer, client));
        }
        let count = pairs.len();
        self.register_provider(provider, pairs).await;
        Ok(count)
    }

    /// Re-resolve keys for one provider or `"all"`. Rejected when the
    /// resolver is the direct environment, where nothing can change.
    pub async fn reload(&self, selector: &str) -> Result<BTreeMap<String, usize>, RouterError> {
        if !self.resolver.reloadable() {
            return Err(RouterError::ReloadUnsupported);
        }

        let selected: Vec<String> = if selector == "all" {
            self.provider_names().await
        } else {
            let known = self.providers.read().await.contains_key(selector);
            if !known {
                return Err(RouterError::UnknownProvider(selector.to_string()));
            }
            vec![selector.to_string()]
        };

        let mut reloaded = BTreeMap::new();
        for provider in selected {
            let count = self.load_provider(&provider).await?;
            reloaded.insert(provider, count);
        }
        Ok(reloaded)
    }

    pub async fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn resolve_targets(&self, spec: &TargetSpec) -> Vec<Target> {
        match spec {
            TargetSpec::Name(model) => vec![Target {
                provider: self.default_provider.clone(),
                model: model.clone(),
            }],
            TargetSpec::One(target) => vec![self.promote(target)],
            TargetSpec::Many(targets) => targets.iter().map(|t| self.promote(t)).collect(),
        }
    }

    fn promote(&self, target: &TargetRef) -> Target {
        Target {
            provider: target
                .provider
                .clone()
                .unwrap_or_else(|| self.default_provider.clone()),
            model: target.model.clone(),
        }
    }

    /// Choose the `(target, slot)` with the smallest estimated wait across
    /// all candidates. Candidates naming a provider with no queuers are
    /// skipped.
    async fn pick(
        &self,
        targets: &[Target],
        tokens_needed: u64,
    ) -> Result<(Target, QueuerSlot), RouterError> {
        let providers = self.providers.read().await;
        let mut best: Option<(i64, Target, QueuerSlot)> = None;

        for target in targets {
            let Some(slots) = providers.get(&target.provider) else {
                continue;
            };
            for slot in slots {
                let wait = slot
                    .queuer
                    .estimate_wait_ms(Some(&target.model), tokens_needed)
                    .await;
                tracing::debug!(
                    provider = %target.provider,
                    model = %target.model,
                    label = %slot.queuer.label(),
                    wait_ms = wait,
                    "router.candidate"
                );
                if best.as_ref().map_or(true, |(current, _, _)| wait < *current) {
                    best = Some((wait, target.clone(), slot.clone()));
                }
            }
        }

        best.map(|(_, target, slot)| (target, slot))
            .ok_or(RouterError::NoAvailableProvider)
    }

    /// Route a chat request. The joined history text sizes the request for
    /// token-based limits.
    pub async fn dispatch_chat(
        &self,
        spec: &TargetSpec,
        history: Vec<ChatMessage>,
    ) -> Result<RoutedResponse, RouterError> {
        let targets = self.resolve_targets(spec);
        let joined = history
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let tokens = self.estimator.estimate(&joined);

        let (target, slot) = self.pick(&targets, tokens).await?;

        let client = slot.client.clone();
        let model = target.model.clone();
        let exec: ExecFn = Box::new(move || {
            Box::pin(async move {
                client
                    .chat(&model, &history)
                    .await
                    .map_err(anyhow::Error::from)
            })
        });

        let response = slot
            .queuer
            .add(exec, Some(&joined), Some(&target.model))
            .await?;

        Ok(RoutedResponse {
            response,
            provider: target.provider,
            model: target.model,
        })
    }

    /// Route an image-analysis request; the prompt text sizes it.
    pub async fn dispatch_image(
        &self,
        spec: &TargetSpec,
        image_b64: String,
        prompt: String,
    ) -> Result<RoutedResponse, RouterError> {
        let targets = self.resolve_targets(spec);
        let tokens = self.estimator.estimate(&prompt);

        let (target, slot) = self.pick(&targets, tokens).await?;

        let client = slot.client.clone();
        let model = target.model.clone();
        let prompt_for_exec = prompt.clone();
        let exec: ExecFn = Box::new(move || {
            Box::pin(async move {
                client
                    .analyze_image(&model, &image_b64, &prompt_for_exec)
                    .await
                    .map_err(anyhow::Error::from)
            })
        });

        let response = slot
            .queuer
            .add(exec, Some(&prompt), Some(&target.model))
            .await?;

        Ok(RoutedResponse {
            response,
            provider: target.provider,
            model: target.model,
        })
    }

    /// Per-provider queue depth totals, reported alongside responses.
    pub async fn provider_queue_totals(&self) -> BTreeMap<String, usize> {
        let providers = self.providers.read().await;
        let mut totals = BTreeMap::new();
        for (provider, slots) in providers.iter() {
            let mut total = 0;
            for slot in slots {
                total += slot.queuer.queue_len().await;
            }
            totals.insert(provider.clone(), total);
        }
        totals
    }

    pub async fn queue_status(&self) -> BTreeMap<String, Vec<QueueStatus>> {
        let providers = self.providers.read().await;
        let mut status = BTreeMap::new();
        for (provider, slots) in providers.iter() {
            let mut queues = Vec::with_capacity(slots.len());
            for slot in slots {
                queues.push(QueueStatus {
                    label: slot.queuer.label().to_string(),
                    queue_length: slot.queuer.queue_len().await,
                    processing: slot.queuer.is_processing().await,
                });
            }
            status.insert(provider.clone(), queues);
        }
        status
    }

    /// Per-queue usage snapshots plus totals aggregated across every queue
    /// and model.
    pub async fn usage_report(&self) -> UsageReport {
        let providers = self.providers.read().await;
        let mut report = UsageReport {
            providers: BTreeMap::new(),
            totals: UsageTotals::default(),
        };

        for (provider, slots) in providers.iter() {
            let mut queues = Vec::with_capacity(slots.len());
            for slot in slots {
                let models = slot.queuer.usage_snapshot().await;
                for usage in models.values() {
                    report.totals.requests_last_second += usage.requests_last_second;
                    report.totals.requests_last_minute += usage.requests_last_minute;
                    report.totals.requests_last_day += usage.requests_last_day;
                    report.totals.month_requests += usage.month.requests.count;
                    report.totals.month_tokens += usage.month.tokens.count;
                }
                queues.push(QueueUsage {
                    label: slot.queuer.label().to_string(),
                    models,
                });
            }
            report.providers.insert(provider.clone(), queues);
        }
        report
    }

    /// Model names harvested from the configured per-model limits, sorted
    /// and deduplicated per provider. Models served purely by the default
    /// limits do not appear here.
    pub async fn models(&self) -> BTreeMap<String, Vec<String>> {
        let providers = self.providers.read().await;
        let mut result = BTreeMap::new();
        for (provider, slots) in providers.iter() {
            let mut names: BTreeSet<String> = BTreeSet::new();
            for slot in slots {
                names.extend(
                    slot.queuer
                        .config()
                        .model_limits
                        .keys()
                        .filter(|name| name.as_str() != DEFAULT_MODEL_KEY)
                        .cloned(),
                );
            }
            result.insert(provider.clone(), names.into_iter().collect());
        }
        result
    }
}
