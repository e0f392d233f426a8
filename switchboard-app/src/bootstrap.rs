//! Wiring from settings to a running broker: resolver, store backend,
//! router, and the bootstrap key check.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use switchboard_common::{KeyConfig, SwitchboardError};
use switchboard_config::{KeyStrategy, Settings, UsageStrategy};
use switchboard_engine::remote::{RemoteStoreFactory, RemoteStoreSettings};
use switchboard_engine::store::{MemoryStoreFactory, UsageStoreFactory};
use switchboard_engine::{HeuristicTokenEstimator, Router};
use switchboard_keys::{
    EnvKeyResolver, HttpKeyResolver, KeyError, KeyResolver, RecordKeyResolver,
    RecordResolverSettings,
};
use switchboard_llm::{PROVIDERS, PROVIDER_MISTRAL};
use switchboard_server::AppState;

/// Fills in the deployment-wide fallback delay on keys that carry none of
/// their own.
struct WithFallbackDelay {
    inner: Arc<dyn KeyResolver>,
    delay_ms: u64,
}

#[async_trait]
impl KeyResolver for WithFallbackDelay {
    async fn resolve(&self, provider: &str) -> std::result::Result<Vec<KeyConfig>, KeyError> {
        let mut configs = self.inner.resolve(provider).await?;
        for config in &mut configs {
            if config.fallback_delay_ms.is_none() {
                config.fallback_delay_ms = Some(self.delay_ms);
            }
        }
        Ok(configs)
    }

    fn reloadable(&self) -> bool {
        self.inner.reloadable()
    }
}

fn build_resolver(settings: &Settings) -> Result<Arc<dyn KeyResolver>> {
    let resolver: Arc<dyn KeyResolver> = match settings.key_strategy {
        KeyStrategy::Env => Arc::new(EnvKeyResolver),
        KeyStrategy::Record => {
            let store = settings
                .record_store
                .as_ref()
                .ok_or_else(|| {
                    SwitchboardError::Config(
                        "key_strategy 'record' requires record_store settings".into(),
                    )
                })?;
            Arc::new(RecordKeyResolver::new(RecordResolverSettings {
                base_url: store.url.clone(),
                identity: store.identity.clone(),
                password: store.password.clone(),
                collection: store.keys_collection.clone(),
            }))
        }
        KeyStrategy::Http => {
            let url = settings
                .key_endpoint
                .clone()
                .ok_or_else(|| {
                    SwitchboardError::Config("key_strategy 'http' requires key_endpoint".into())
                })?;
            Arc::new(HttpKeyResolver::new(url))
        }
    };

    Ok(match settings.fallback_delay_ms {
        Some(delay_ms) => Arc::new(WithFallbackDelay {
            inner: resolver,
            delay_ms,
        }),
        None => resolver,
    })
}

fn build_store_factory(settings: &Settings) -> Result<Arc<dyn UsageStoreFactory>> {
    Ok(match settings.usage_strategy {
        UsageStrategy::Memory => Arc::new(MemoryStoreFactory),
        UsageStrategy::Remote => {
            let store = settings
                .record_store
                .as_ref()
                .ok_or_else(|| {
                    SwitchboardError::Config(
                        "usage_strategy 'remote' requires record_store settings".into(),
                    )
                })?;
            Arc::new(RemoteStoreFactory {
                settings: RemoteStoreSettings {
                    base_url: store.url.clone(),
                    identity: store.identity.clone(),
                    password: store.password.clone(),
                    collection: store.usage_collection.clone(),
                    flush_interval: Duration::from_secs(settings.flush_interval_secs),
                },
            })
        }
    })
}

pub async fn build(settings: Settings) -> Result<Arc<AppState>> {
    let resolver = build_resolver(&settings)?;
    let store_factory = build_store_factory(&settings)?;
    let estimator = Arc::new(HeuristicTokenEstimator);

    let router = Router::new(
        resolver,
        store_factory,
        estimator.clone(),
        PROVIDER_MISTRAL,
    );

    let mut default_provider_keys = 0;
    for provider in PROVIDERS {
        match router.load_provider(provider).await {
            Ok(count) => {
                if provider == PROVIDER_MISTRAL {
                    default_provider_keys = count;
                }
            }
            Err(err) if provider == PROVIDER_MISTRAL => {
                return Err(err).context("resolving keys for the default provider");
            }
            Err(err) => {
                tracing::warn!(provider, error = %err, "bootstrap.provider.skipped");
            }
        }
    }

    if default_provider_keys == 0 {
        return Err(SwitchboardError::Bootstrap(format!(
            "no API keys resolved for default provider '{PROVIDER_MISTRAL}'"
        ))
        .into());
    }

    Ok(Arc::new(AppState {
        router: Arc::new(router),
        estimator,
    }))
}
