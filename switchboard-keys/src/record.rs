//! Key resolution backed by an authenticated record store.
//!
//! The store speaks a PocketBase-style REST API: a password grant yields a
//! bearer token, and keys live as records in a collection. Records carry a
//! `provider` (or legacy `type`) field used for filtering and an optional
//! `limit` field in either the compact or the nested shape.

use crate::{configs_from_entries, KeyEntry, KeyError, KeyResolver};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use switchboard_common::KeyConfig;
use tokio::sync::Mutex;

const LIST_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone)]
pub struct RecordResolverSettings {
    pub base_url: String,
    pub identity: String,
    pub password: String,
    /// Collection holding the key records.
    pub collection: String,
}

pub struct RecordKeyResolver {
    client: reqwest::Client,
    settings: RecordResolverSettings,
    token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct RecordList {
    #[serde(default)]
    items: Vec<KeyEntry>,
}

impl RecordKeyResolver {
    pub fn new(settings: RecordResolverSettings) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            settings,
            token: Mutex::new(None),
        }
    }

    async fn auth_token(&self) -> Result<String, KeyError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = format!(
            "{}/api/collections/users/auth-with-password",
            self.settings.base_url
        );
        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "identity": self.settings.identity,
                "password": self.settings.password,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(KeyError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let auth: AuthResponse = resp.json().await?;
        *cached = Some(auth.token.clone());
        Ok(auth.token)
    }

    async fn list_records(&self, token: &str) -> Result<reqwest::Response, KeyError> {
        let url = format!(
            "{}/api/collections/{}/records",
            self.settings.base_url, self.settings.collection
        );
        Ok(self
            .client
            .get(&url)
            .header("Authorization", token)
            .query(&[("perPage", LIST_PAGE_SIZE.to_string())])
            .send()
            .await?)
    }
}

#[async_trait]
impl KeyResolver for RecordKeyResolver {
    async fn resolve(&self, provider: &str) -> Result<Vec<KeyConfig>, KeyError> {
        let token = self.auth_token().await?;
        let mut resp = self.list_records(&token).await?;

        // An expired token earns exactly one re-authentication.
        if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 {
            self.token.lock().await.take();
            let token = self.auth_token().await?;
            resp = self.list_records(&token).await?;
        }

        if !resp.status().is_success() {
            return Err(KeyError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let list: RecordList = resp.json().await?;
        let configs = configs_from_entries(list.items, provider);
        tracing::info!(provider, count = configs.len(), "keys.record.resolved");
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> RecordResolverSettings {
        RecordResolverSettings {
            base_url: server.uri(),
            identity: "ops@example.com".into(),
            password: "hunter2".into(),
            collection: "api_keys".into(),
        }
    }

    #[tokio::test]
    async fn resolves_filtered_records_with_limits() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/collections/users/auth-with-password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"token": "tok-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/collections/api_keys/records"))
            .and(header("Authorization", "tok-1"))
            .and(query_param("perPage", "200"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "r1", "key": "sk-m1", "provider": "mistral", "label": "m-main",
                     "limit": {"RPS": 1, "RPM": 100}},
                    {"id": "r2", "key": "sk-g1", "provider": "gemini", "label": "g-main"},
                    {"id": "r3", "key": "sk-m2", "type": "mistral",
                     "limit": {"default": {"RPS": 2}, "fast": {"RPS": 50}}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = RecordKeyResolver::new(settings(&server));
        let configs = resolver.resolve("mistral").await.unwrap();

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].label, "m-main");
        assert_eq!(configs[0].default_limits.len(), 2);
        assert_eq!(configs[1].key, "sk-m2");
        assert!(configs[1].model_limits.contains_key("fast"));
    }

    #[tokio::test]
    async fn expired_token_triggers_one_reauth() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/collections/users/auth-with-password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"token": "tok-fresh"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/collections/api_keys/records"))
            .and(header("Authorization", "tok-stale"))
            .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/collections/api_keys/records"))
            .and(header("Authorization", "tok-fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "r1", "key": "sk-1", "provider": "mistral"}]
            })))
            .mount(&server)
            .await;

        let resolver = RecordKeyResolver::new(settings(&server));
        *resolver.token.lock().await = Some("tok-stale".into());

        let configs = resolver.resolve("mistral").await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].key, "sk-1");
    }
}
