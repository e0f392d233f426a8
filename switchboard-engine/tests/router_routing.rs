//! Router selection behavior: least-wait routing, tie-breaking, and the
//! no-provider failure path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_common::{ChatMessage, KeyConfig, LimitKind, LimitSpec};
use switchboard_engine::queue::ExecFn;
use switchboard_engine::store::MemoryStoreFactory;
use switchboard_engine::{
    HeuristicTokenEstimator, MemoryUsageStore, RequestQueuer, Router, RouterError, TargetSpec,
};
use switchboard_keys::{KeyError, KeyResolver};
use switchboard_llm::traits::{LlmClient, LlmError, LlmResponse};
use tokio::sync::Notify;

struct NoKeys;

#[async_trait]
impl KeyResolver for NoKeys {
    async fn resolve(&self, _provider: &str) -> Result<Vec<KeyConfig>, KeyError> {
        Ok(Vec::new())
    }
}

/// Client whose replies carry its name; optionally parks until released.
struct NamedClient {
    name: &'static str,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl LlmClient for NamedClient {
    async fn chat(
        &self,
        _model: &str,
        _history: &[ChatMessage],
    ) -> Result<LlmResponse, LlmError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(LlmResponse {
            text: format!("served-by-{}", self.name),
            model: None,
            tokens_used: None,
        })
    }

    async fn analyze_image(
        &self,
        _model: &str,
        _image_b64: &str,
        _prompt: &str,
    ) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse {
            text: format!("image-by-{}", self.name),
            model: None,
            tokens_used: None,
        })
    }

    fn provider(&self) -> &str {
        "mistral"
    }
}

fn limited_config(label: &str) -> KeyConfig {
    KeyConfig {
        key: format!("sk-{label}"),
        label: label.to_string(),
        default_limits: vec![LimitSpec::new(LimitKind::RequestsPerSecond, 1)],
        model_limits: HashMap::new(),
        fallback_delay_ms: None,
    }
}

fn router() -> Router {
    Router::new(
        Arc::new(NoKeys),
        Arc::new(MemoryStoreFactory),
        Arc::new(HeuristicTokenEstimator),
        "mistral",
    )
}

fn queuer(label: &str) -> RequestQueuer {
    RequestQueuer::new(
        limited_config(label),
        MemoryUsageStore::shared(),
        Arc::new(HeuristicTokenEstimator),
    )
}

fn parked_exec(gate: Arc<Notify>) -> ExecFn {
    Box::new(move || {
        Box::pin(async move {
            gate.notified().await;
            Ok(LlmResponse {
                text: "parked".into(),
                model: None,
                tokens_used: None,
            })
        })
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn backlogged_queue_loses_to_an_empty_one() {
    let router = router();
    let gate = Arc::new(Notify::new());

    // Queue A holds five pending items for the model; queue B is idle.
    let queuer_a = queuer("queue-a");
    for _ in 0..5 {
        let q = queuer_a.clone();
        let exec = parked_exec(gate.clone());
        tokio::spawn(async move { q.add(exec, None, Some("m")).await });
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(queuer_a.queue_len().await >= 4);

    let client_a: Arc<dyn LlmClient + Send + Sync> = Arc::new(NamedClient {
        name: "a",
        gate: Some(gate.clone()),
    });
    let client_b: Arc<dyn LlmClient + Send + Sync> = Arc::new(NamedClient {
        name: "b",
        gate: None,
    });
    router
        .register_provider(
            "mistral",
            vec![(queuer_a, client_a), (queuer("queue-b"), client_b)],
        )
        .await;

    let spec = TargetSpec::Name("m".to_string());
    let sixth = router
        .dispatch_chat(&spec, vec![ChatMessage::user("hi")])
        .await
        .unwrap();
    assert_eq!(sixth.response.text, "served-by-b");
    assert_eq!(sixth.provider, "mistral");
    assert_eq!(sixth.model, "m");

    let seventh = router
        .dispatch_chat(&spec, vec![ChatMessage::user("again")])
        .await
        .unwrap();
    assert_eq!(seventh.response.text, "served-by-b");

    // Unpark queue A so its dispatcher can drain.
    for _ in 0..6 {
        gate.notify_waiters();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn ties_break_in_first_seen_order() {
    let router = router();
    let client_a: Arc<dyn LlmClient + Send + Sync> =
        Arc::new(NamedClient { name: "a", gate: None });
    let client_b: Arc<dyn LlmClient + Send + Sync> =
        Arc::new(NamedClient { name: "b", gate: None });
    router
        .register_provider(
            "mistral",
            vec![(queuer("queue-a"), client_a), (queuer("queue-b"), client_b)],
        )
        .await;

    let spec = TargetSpec::Name("m".to_string());
    let routed = router
        .dispatch_chat(&spec, vec![ChatMessage::user("hi")])
        .await
        .unwrap();
    assert_eq!(routed.response.text, "served-by-a");
}

#[tokio::test]
async fn unknown_provider_candidates_are_skipped_then_fail() {
    let router = router();

    let spec = TargetSpec::Name("m".to_string());
    let err = router
        .dispatch_chat(&spec, vec![ChatMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::NoAvailableProvider));
}

#[tokio::test]
async fn bare_model_names_promote_to_the_default_provider() {
    let router = router();
    let client: Arc<dyn LlmClient + Send + Sync> =
        Arc::new(NamedClient { name: "a", gate: None });
    router
        .register_provider("mistral", vec![(queuer("queue-a"), client)])
        .await;

    // The raw JSON forms a client would post.
    let bare: TargetSpec = serde_json::from_str("\"m\"").unwrap();
    let explicit: TargetSpec =
        serde_json::from_str(r#"{"provider": "mistral", "model": "m"}"#).unwrap();
    let list: TargetSpec =
        serde_json::from_str(r#"[{"provider": "nope", "model": "x"}, {"model": "m"}]"#).unwrap();

    for spec in [bare, explicit, list] {
        let routed = router
            .dispatch_chat(&spec, vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(routed.provider, "mistral");
        assert_eq!(routed.model, "m");
    }
}

#[tokio::test]
async fn reload_is_rejected_for_the_environment_resolver() {
    struct EnvLike;
    #[async_trait]
    impl KeyResolver for EnvLike {
        async fn resolve(&self, _provider: &str) -> Result<Vec<KeyConfig>, KeyError> {
            Ok(Vec::new())
        }
        fn reloadable(&self) -> bool {
            false
        }
    }

    let router = Router::new(
        Arc::new(EnvLike),
        Arc::new(MemoryStoreFactory),
        Arc::new(HeuristicTokenEstimator),
        "mistral",
    );
    let err = router.reload("all").await.unwrap_err();
    assert!(matches!(err, RouterError::ReloadUnsupported));
}

#[tokio::test]
async fn models_endpoint_data_excludes_the_default_marker() {
    let router = router();
    let mut config = limited_config("queue-a");
    config
        .model_limits
        .insert("__default__".into(), vec![LimitSpec::new(LimitKind::RequestsPerSecond, 1)]);
    config
        .model_limits
        .insert("small".into(), vec![LimitSpec::new(LimitKind::RequestsPerSecond, 5)]);
    config
        .model_limits
        .insert("large".into(), vec![LimitSpec::new(LimitKind::RequestsPerSecond, 2)]);

    let client: Arc<dyn LlmClient + Send + Sync> =
        Arc::new(NamedClient { name: "a", gate: None });
    let queuer = RequestQueuer::new(
        config,
        MemoryUsageStore::shared(),
        Arc::new(HeuristicTokenEstimator),
    );
    router.register_provider("mistral", vec![(queuer, client)]).await;

    let models = router.models().await;
    assert_eq!(models["mistral"], vec!["large".to_string(), "small".to_string()]);
}
