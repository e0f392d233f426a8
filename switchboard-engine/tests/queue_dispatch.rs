//! End-to-end behavior of a single queuer: pacing, head-of-line avoidance,
//! FIFO per model, failure handling, fast-path transparency, and the wait
//! estimator.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use switchboard_common::{KeyConfig, LimitKind, LimitSpec};
use switchboard_engine::queue::ExecFn;
use switchboard_engine::{
    HeuristicTokenEstimator, MemoryUsageStore, RequestQueuer, UsageBucket, UsageStore,
};
use switchboard_llm::traits::LlmResponse;
use tokio::time::sleep;

fn response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        model: None,
        tokens_used: None,
    }
}

fn key_config(default_limits: Vec<LimitSpec>) -> KeyConfig {
    KeyConfig {
        key: "sk-test".into(),
        label: "test-queue".into(),
        default_limits,
        model_limits: HashMap::new(),
        fallback_delay_ms: None,
    }
}

fn queuer(config: KeyConfig) -> RequestQueuer {
    RequestQueuer::new(
        config,
        MemoryUsageStore::shared(),
        Arc::new(HeuristicTokenEstimator),
    )
}

/// Execute closure that records its start offset (ms since `origin`) under
/// `tag` and succeeds immediately.
fn stamped_exec(
    tag: &'static str,
    origin: Instant,
    log: Arc<Mutex<Vec<(&'static str, i64)>>>,
) -> ExecFn {
    Box::new(move || {
        Box::pin(async move {
            log.lock()
                .unwrap()
                .push((tag, origin.elapsed().as_millis() as i64));
            Ok(response(tag))
        })
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn rps_limit_paces_items_one_second_apart() {
    let queuer = queuer(key_config(vec![LimitSpec::new(
        LimitKind::RequestsPerSecond,
        1,
    )]));
    let origin = Instant::now();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for tag in ["first", "second", "third"] {
        let q = queuer.clone();
        let exec = stamped_exec(tag, origin, log.clone());
        handles.push(tokio::spawn(async move {
            q.add(exec, None, Some("m")).await.unwrap()
        }));
        sleep(Duration::from_millis(10)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let log = log.lock().unwrap();
    let at = |tag| log.iter().find(|(t, _)| *t == tag).unwrap().1;
    assert!(at("first") < 300, "first runs immediately, got {}", at("first"));
    assert!(at("second") >= 1_000, "second waits a full window");
    assert!(at("third") >= 2_000, "third waits two windows");

    let snapshot = queuer.usage_snapshot().await;
    assert!(snapshot["m"].requests_last_second <= 1);
    assert_eq!(snapshot["m"].month.requests.count, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn throttled_model_does_not_block_a_free_one() {
    let mut config = key_config(vec![LimitSpec::new(LimitKind::RequestsPerSecond, 1)]);
    config.model_limits.insert(
        "fast".into(),
        vec![LimitSpec::new(LimitKind::RequestsPerSecond, 100)],
    );
    let queuer = queuer(config);
    let origin = Instant::now();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for (tag, model) in [("slow-1", "slow"), ("slow-2", "slow"), ("fast-1", "fast")] {
        let q = queuer.clone();
        let exec = stamped_exec(tag, origin, log.clone());
        handles.push(tokio::spawn(async move {
            q.add(exec, None, Some(model)).await.unwrap()
        }));
        sleep(Duration::from_millis(10)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let log = log.lock().unwrap();
    let order: Vec<&str> = log.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(order, vec!["slow-1", "fast-1", "slow-2"]);

    let fast_at = log.iter().find(|(t, _)| *t == "fast-1").unwrap().1;
    assert!(
        fast_at < 500,
        "fast item must overtake the throttled slow one, ran at {fast_at}ms"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn same_model_items_complete_in_fifo_order() {
    let queuer = queuer(key_config(vec![LimitSpec::new(
        LimitKind::RequestsPerSecond,
        2,
    )]));
    let origin = Instant::now();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for tag in ["a", "b", "c", "d"] {
        let q = queuer.clone();
        let exec = stamped_exec(tag, origin, log.clone());
        handles.push(tokio::spawn(async move {
            q.add(exec, None, Some("m")).await.unwrap()
        }));
        sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let order: Vec<&str> = log.lock().unwrap().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(order, vec!["a", "b", "c", "d"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_execute_consumes_no_budget_and_propagates() {
    let queuer = queuer(key_config(vec![LimitSpec::new(
        LimitKind::RequestsPerSecond,
        1,
    )]));

    let failing: ExecFn =
        Box::new(|| Box::pin(async { Err(anyhow::anyhow!("provider exploded")) }));
    let err = queuer.add(failing, None, Some("m")).await.unwrap_err();
    assert!(err.to_string().contains("provider exploded"));

    let snapshot = queuer.usage_snapshot().await;
    assert_eq!(snapshot["m"].month.requests.count, 0);
    assert_eq!(snapshot["m"].requests_last_day, 0);

    // The rejected item left no trace, so the next one runs immediately.
    let origin = Instant::now();
    let ok: ExecFn = Box::new(|| Box::pin(async { Ok(response("ok")) }));
    queuer.add(ok, None, Some("m")).await.unwrap();
    assert!(origin.elapsed() < Duration::from_millis(500));

    let snapshot = queuer.usage_snapshot().await;
    assert_eq!(snapshot["m"].month.requests.count, 1);
}

struct CountingStore {
    inner: MemoryUsageStore,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

#[async_trait]
impl UsageStore for CountingStore {
    async fn get(&self, model_key: &str) -> UsageBucket {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(model_key).await
    }
    async fn set(&self, model_key: &str, bucket: UsageBucket) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(model_key, bucket).await
    }
    async fn entries(&self) -> Vec<(String, UsageBucket)> {
        self.inner.entries().await
    }
    async fn persist(&self, now: i64) {
        self.inner.persist(now).await
    }
    async fn dispose(&self) {}
}

#[tokio::test]
async fn no_limits_and_no_delay_bypasses_the_queue_entirely() {
    let store = Arc::new(CountingStore {
        inner: MemoryUsageStore::new(),
        reads: AtomicUsize::new(0),
        writes: AtomicUsize::new(0),
    });
    let queuer = RequestQueuer::new(
        key_config(Vec::new()),
        store.clone(),
        Arc::new(HeuristicTokenEstimator),
    );

    let exec: ExecFn = Box::new(|| Box::pin(async { Ok(response("direct")) }));
    let resp = queuer.add(exec, Some("some text"), Some("m")).await.unwrap();

    assert_eq!(resp.text, "direct");
    assert_eq!(queuer.queue_len().await, 0);
    assert!(!queuer.is_processing().await);
    assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn fallback_delay_spaces_items_without_structured_limits() {
    let mut config = key_config(Vec::new());
    config.fallback_delay_ms = Some(300);
    let queuer = queuer(config);
    let origin = Instant::now();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for tag in ["a", "b"] {
        let q = queuer.clone();
        let exec = stamped_exec(tag, origin, log.clone());
        handles.push(tokio::spawn(async move {
            q.add(exec, None, None).await.unwrap()
        }));
        sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let log = log.lock().unwrap();
    let b_at = log.iter().find(|(t, _)| *t == "b").unwrap().1;
    assert!(b_at >= 300, "second item must wait out the delay, ran at {b_at}ms");
}

#[tokio::test(flavor = "multi_thread")]
async fn estimate_grows_with_queue_depth() {
    let queuer = queuer(key_config(vec![LimitSpec::new(
        LimitKind::RequestsPerSecond,
        1,
    )]));

    let empty_estimate = queuer.estimate_wait_ms(Some("m"), 0).await;
    assert_eq!(empty_estimate, 0);

    // Park the dispatcher behind slow executes to let the queue build up.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let q = queuer.clone();
        let exec: ExecFn = Box::new(|| {
            Box::pin(async {
                sleep(Duration::from_millis(400)).await;
                Ok(response("slow"))
            })
        });
        handles.push(tokio::spawn(async move { q.add(exec, None, Some("m")).await }));
        sleep(Duration::from_millis(10)).await;
    }

    let shallow = queuer.estimate_wait_ms(Some("m"), 0).await;

    for _ in 0..2 {
        let q = queuer.clone();
        let exec: ExecFn = Box::new(|| Box::pin(async { Ok(response("quick")) }));
        handles.push(tokio::spawn(async move { q.add(exec, None, Some("m")).await }));
    }
    sleep(Duration::from_millis(10)).await;

    let deep = queuer.estimate_wait_ms(Some("m"), 0).await;
    assert!(
        deep >= shallow,
        "estimate must be non-decreasing in queue depth: {shallow} -> {deep}"
    );

    for handle in handles {
        let _ = handle.await.unwrap();
    }
}

#[tokio::test]
async fn estimator_never_touches_live_buckets() {
    let store = MemoryUsageStore::shared();
    let queuer = RequestQueuer::new(
        key_config(vec![LimitSpec::new(LimitKind::RequestsPerSecond, 1)]),
        store.clone(),
        Arc::new(HeuristicTokenEstimator),
    );

    let before = store.entries().await;
    let _ = queuer.estimate_wait_ms(Some("m"), 1_000).await;
    let after = store.entries().await;
    assert_eq!(before, after, "simulation must not leak into the live store");
}
