#![allow(dead_code)]

use std::{future::Future, time::Duration};

use smq::{
    ConsumerOptions, DeliveryModel, QueueManager, QueueParams, QueueType, RedisStore,
    consumer::{DequeuerOptions, HeartbeatOptions, MaintenanceOptions, RunnerOptions},
    keys,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
const NAMESPACE_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

pub fn init_tracing() {
    // Several tests share one binary, only the first install wins
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "smq=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Connects to `REDIS_URL`, failing the test when no server answers.
pub async fn connect() -> RedisStore {
    init_tracing();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
    tokio::time::timeout(Duration::from_secs(2), RedisStore::connect(&url))
        .await
        .unwrap_or_else(|_| panic!("Redis at {url} did not answer"))
        .unwrap_or_else(|e| panic!("Failed to connect to redis at {url}: {e}"))
}

/// A namespace no other test run uses.
pub fn test_namespace() -> String {
    format!("test-{}", nanoid::nanoid!(10, &NAMESPACE_ALPHABET))
}

pub async fn create_queue(
    store: &RedisStore,
    namespace: &str,
    name: &str,
    queue_type: QueueType,
    delivery_model: DeliveryModel,
) -> QueueParams {
    let queue = QueueParams::new(namespace, name);
    QueueManager::new(store.clone())
        .save(&queue, queue_type, delivery_model)
        .await
        .expect("Failed to create queue");
    queue
}

/// Short intervals so tests settle within a few seconds.
pub fn fast_options() -> ConsumerOptions {
    ConsumerOptions {
        heartbeat: HeartbeatOptions {
            interval: Duration::from_millis(200),
            ttl: Duration::from_secs(2),
            max_backoff: Duration::from_secs(1),
        },
        dequeuer: DequeuerOptions {
            blocking: true,
            blocking_timeout: Duration::from_millis(300),
            idle_threshold: 5,
            idle_backoff: Duration::from_millis(100),
            rate_limit_backoff: Duration::from_millis(100),
        },
        runner: RunnerOptions {
            reconcile_interval: Duration::from_millis(500),
        },
        maintenance: MaintenanceOptions {
            interval: Duration::from_millis(100),
            ..Default::default()
        },
        messages: Default::default(),
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// Helper to clean up Redis keys for a given namespace
pub async fn cleanup_redis_keys(store: &RedisStore, namespace: &str) {
    let mut conn = store.conn();
    let keys_pattern = format!("smq:{namespace}:*");

    let found: Vec<String> = redis::cmd("KEYS")
        .arg(&keys_pattern)
        .query_async(&mut conn)
        .await
        .unwrap_or_default();
    if !found.is_empty() {
        redis::cmd("DEL")
            .arg(found)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_default();
    }

    let queues: Vec<String> = redis::cmd("SMEMBERS")
        .arg(keys::queues_set())
        .query_async(&mut conn)
        .await
        .unwrap_or_default();
    let ours: Vec<String> = queues
        .into_iter()
        .filter(|json| json.contains(&format!("\"{namespace}\"")))
        .collect();
    if !ours.is_empty() {
        redis::cmd("SREM")
            .arg(keys::queues_set())
            .arg(ours)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_default();
    }
}

/// Receive consumer events until one satisfies `stop` or `timeout` passes.
/// Returns everything received, the stopping event last.
pub async fn collect_events_until(
    rx: &mut tokio::sync::broadcast::Receiver<smq::ConsumerEvent>,
    timeout: Duration,
    mut stop: impl FnMut(&smq::ConsumerEvent) -> bool,
) -> Vec<smq::ConsumerEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = stop(&event);
                    seen.push(event);
                    if done {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    })
    .await;
    seen
}
