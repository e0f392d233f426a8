//! Loader for broker settings with environment + optional file overlays.
//!
//! Settings merge three sources, later ones winning: an optional YAML/TOML
//! file, `SWITCHBOARD_`-prefixed environment variables (`__` separates
//! nesting, e.g. `SWITCHBOARD_RECORD_STORE__URL`), and the two bare legacy
//! knobs `USAGE_STRATEGY` and `KEY_STRATEGY`. String values may reference
//! `${VAR}` placeholders, expanded recursively with a depth cap.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

const MAXIMUM_ENV_EXPANSION_DEPTH: usize = 8;

/// How usage counters are stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStrategy {
    #[default]
    Memory,
    Remote,
}

/// Where API keys come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    #[default]
    Env,
    Record,
    Http,
}

/// Credentials and collection names for the remote record store, shared by
/// the remote usage backend and the record key resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordStoreSettings {
    pub url: String,
    pub identity: String,
    pub password: String,
    #[serde(default = "default_usage_collection")]
    pub usage_collection: String,
    #[serde(default = "default_keys_collection")]
    pub keys_collection: String,
}

fn default_usage_collection() -> String {
    "usage".into()
}
fn default_keys_collection() -> String {
    "api_keys".into()
}
fn default_bind() -> String {
    "0.0.0.0:3000".into()
}
fn default_flush_interval_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub usage_strategy: UsageStrategy,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    /// Listen address for the HTTP surface.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Inter-request delay for keys without structured limits.
    #[serde(default)]
    pub fallback_delay_ms: Option<u64>,
    /// Cadence of the remote usage store's background flush.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default)]
    pub record_store: Option<RecordStoreSettings>,
    /// Endpoint for the HTTP key strategy.
    #[serde(default)]
    pub key_endpoint: Option<String>,
}

fn expand_env_in_value(v: &mut Value) {
    match v {
        Value::String(s) => {
            if s.contains('$') {
                let mut cur = std::mem::take(s);
                for _ in 0..MAXIMUM_ENV_EXPANSION_DEPTH {
                    let expanded = match shellexpand::env(&cur) {
                        Ok(cow) => cow.into_owned(),
                        Err(_) => cur.clone(),
                    };
                    if expanded == cur {
                        break;
                    }
                    cur = expanded;
                }
                *s = cur;
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(expand_env_in_value),
        Value::Object(obj) => obj.values_mut().for_each(expand_env_in_value),
        _ => {}
    }
}

/// Bare (unprefixed) environment knobs kept for compatibility with existing
/// deployments; they win over every other source.
fn apply_bare_env(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var("USAGE_STRATEGY") {
        settings.usage_strategy = match raw.trim().to_lowercase().as_str() {
            "memory" => UsageStrategy::Memory,
            "remote" => UsageStrategy::Remote,
            other => {
                return Err(ConfigError::Message(format!(
                    "USAGE_STRATEGY must be 'memory' or 'remote', got '{other}'"
                )))
            }
        };
    }
    if let Ok(raw) = std::env::var("KEY_STRATEGY") {
        settings.key_strategy = match raw.trim().to_lowercase().as_str() {
            "env" => KeyStrategy::Env,
            "record" => KeyStrategy::Record,
            "http" => KeyStrategy::Http,
            other => {
                return Err(ConfigError::Message(format!(
                    "KEY_STRATEGY must be 'env', 'record', or 'http', got '{other}'"
                )))
            }
        };
    }
    Ok(())
}

/// Builder hiding the `config` crate wiring (file + env overrides).
pub struct SettingsLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    /// Start with the default sources: `SWITCHBOARD_` env overrides only.
    ///
    /// ```
    /// use switchboard_config::{SettingsLoader, UsageStrategy};
    ///
    /// let settings = SettingsLoader::new().load().expect("valid settings");
    /// assert_eq!(settings.usage_strategy, UsageStrategy::Memory);
    /// assert_eq!(settings.bind, "0.0.0.0:3000");
    /// ```
    pub fn new() -> Self {
        let builder =
            Config::builder().add_source(Environment::with_prefix("SWITCHBOARD").separator("__"));
        Self { builder }
    }

    /// Attach a YAML/TOML/JSON file; the `config` crate infers format by suffix.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self.builder.add_source(File::from(path.as_ref()).required(false));
        self
    }

    /// Merge an inline YAML snippet (tests, CLI overrides).
    ///
    /// ```
    /// use switchboard_config::{KeyStrategy, SettingsLoader};
    ///
    /// let settings = SettingsLoader::new()
    ///     .with_yaml_str("key_strategy: record\nbind: 127.0.0.1:8080")
    ///     .load()
    ///     .unwrap();
    /// assert_eq!(settings.key_strategy, KeyStrategy::Record);
    /// assert_eq!(settings.bind, "127.0.0.1:8080");
    /// ```
    pub fn with_yaml_str(mut self, yaml: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(yaml, config::FileFormat::Yaml));
        self
    }

    /// Consume the builder and deserialize the merged sources.
    pub fn load(self) -> Result<Settings, ConfigError> {
        let cfg = self.builder.build()?;

        let mut v: Value = cfg.try_deserialize()?;
        expand_env_in_value(&mut v);

        let mut typed: Settings =
            serde_json::from_value(v).map_err(|e| ConfigError::Message(e.to_string()))?;
        apply_bare_env(&mut typed)?;

        Ok(typed)
    }
}
