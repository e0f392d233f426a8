//! Key-configuration resolvers.
//!
//! A resolver turns a provider name into the list of [`KeyConfig`]s the
//! broker should schedule over. Three strategies exist, selected by the
//! `KEY_STRATEGY` setting: plain environment variables, an authenticated
//! record store, and a JSON HTTP endpoint. The record and HTTP strategies
//! share one entry shape and one `limit`-field grammar; entries are
//! deduplicated by the raw key string.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use switchboard_common::{KeyConfig, LimitKind, LimitSpec};

mod record;

pub use record::{RecordKeyResolver, RecordResolverSettings};

/// Inter-request delay applied to keys that carry no structured limits.
pub const DEFAULT_FALLBACK_DELAY_MS: u64 = 1000;

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("key source error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed key entry: {0}")]
    Malformed(String),
}

/// Source of key configurations for a provider.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, provider: &str) -> Result<Vec<KeyConfig>, KeyError>;

    /// Whether re-resolving can yield a different answer. The direct
    /// environment strategy is static, so reload is rejected for it.
    fn reloadable(&self) -> bool {
        true
    }
}

/// One key per provider taken straight from `<PROVIDER>_API_KEY`.
pub struct EnvKeyResolver;

#[async_trait]
impl KeyResolver for EnvKeyResolver {
    async fn resolve(&self, provider: &str) -> Result<Vec<KeyConfig>, KeyError> {
        let var = format!("{}_API_KEY", provider.to_uppercase());
        match std::env::var(&var) {
            Ok(key) if !key.trim().is_empty() => Ok(vec![KeyConfig {
                key: key.trim().to_string(),
                label: format!("{provider}-env"),
                default_limits: Vec::new(),
                model_limits: HashMap::new(),
                fallback_delay_ms: Some(DEFAULT_FALLBACK_DELAY_MS),
            }]),
            _ => {
                tracing::debug!(provider, %var, "keys.env.missing");
                Ok(Vec::new())
            }
        }
    }

    fn reloadable(&self) -> bool {
        false
    }
}

/// HTTP endpoint returning a JSON array of key entries.
pub struct HttpKeyResolver {
    client: reqwest::Client,
    url: String,
}

impl HttpKeyResolver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl KeyResolver for HttpKeyResolver {
    async fn resolve(&self, provider: &str) -> Result<Vec<KeyConfig>, KeyError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(KeyError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let entries: Vec<KeyEntry> = resp.json().await?;
        Ok(configs_from_entries(entries, provider))
    }
}

/// Wire shape shared by the record-store and HTTP strategies.
#[derive(Debug, Deserialize)]
pub(crate) struct KeyEntry {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, alias = "type")]
    pub provider: Option<String>,
    #[serde(default)]
    pub limit: Option<serde_json::Value>,
    #[serde(default, alias = "fallbackDelayMs")]
    pub fallback_delay_ms: Option<u64>,
}

pub(crate) fn configs_from_entries(entries: Vec<KeyEntry>, provider: &str) -> Vec<KeyConfig> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut configs = Vec::new();

    for (idx, entry) in entries.into_iter().enumerate() {
        if let Some(entry_provider) = &entry.provider {
            if entry_provider != provider {
                continue;
            }
        }
        if entry.key.trim().is_empty() || !seen.insert(entry.key.clone()) {
            continue;
        }

        let (default_limits, model_limits) = entry
            .limit
            .as_ref()
            .map(parse_limit_value)
            .unwrap_or_default();

        configs.push(KeyConfig {
            label: entry
                .label
                .unwrap_or_else(|| format!("{provider}-{idx}")),
            key: entry.key,
            default_limits,
            model_limits,
            fallback_delay_ms: entry.fallback_delay_ms,
        });
    }

    configs
}

/// Parse the optional `limit` field.
///
/// Two shapes are accepted. The compact form maps limit codes straight to
/// ceilings and applies key-wide:
///
/// ```json
/// { "RPS": 1, "TPM": 500000 }
/// ```
///
/// The nested form scopes limits per model, with `default` (or
/// `__default__`) naming the key-wide set:
///
/// ```json
/// { "default": { "RPS": 1 }, "mistral-small-latest": { "RPS": 5 } }
/// ```
///
/// The field may also arrive as a JSON-encoded string of either shape.
/// Unknown codes and non-numeric ceilings are skipped.
pub(crate) fn parse_limit_value(
    value: &serde_json::Value,
) -> (Vec<LimitSpec>, HashMap<String, Vec<LimitSpec>>) {
    let mut defaults = Vec::new();
    let mut per_model = HashMap::new();

    let parsed_string;
    let value = match value {
        serde_json::Value::String(raw) => {
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(inner) => {
                    parsed_string = inner;
                    &parsed_string
                }
                Err(_) => return (defaults, per_model),
            }
        }
        other => other,
    };

    let Some(object) = value.as_object() else {
        return (defaults, per_model);
    };

    for (name, entry) in object {
        match entry {
            serde_json::Value::Number(n) => {
                if let (Some(kind), Some(limit)) = (LimitKind::from_code(name), n.as_u64()) {
                    defaults.push(LimitSpec::new(kind, limit));
                }
            }
            serde_json::Value::Object(spec_map) => {
                let specs: Vec<LimitSpec> = spec_map
                    .iter()
                    .filter_map(|(code, ceiling)| {
                        Some(LimitSpec::new(
                            LimitKind::from_code(code)?,
                            ceiling.as_u64()?,
                        ))
                    })
                    .collect();
                if specs.is_empty() {
                    continue;
                }
                if name == "default" || name == switchboard_common::DEFAULT_MODEL_KEY {
                    defaults.extend(specs);
                } else {
                    per_model.insert(name.clone(), specs);
                }
            }
            _ => {}
        }
    }

    (defaults, per_model)
}
