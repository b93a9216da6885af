use std::{collections::HashMap, time::Duration};

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::sync::Mutex;

use crate::{
    error::SmqError,
    events::{ConsumerEvent, EventBus},
    keys,
    lifecycle::{Lifecycle, Runnable},
    shutdown::WorkerHandle,
    store::RedisStore,
};

#[derive(Clone, Debug)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    /// Lifetime of the heartbeat key. A consumer is dead once it expires.
    pub ttl: Duration,
    /// Upper bound of the retry delay after failed writes
    pub max_backoff: Duration,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            ttl: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Delay before the next beat: nominal after a success, doubled (capped) after a failure.
pub fn next_delay(current: Duration, failed: bool, options: &HeartbeatOptions) -> Duration {
    if failed {
        current.saturating_mul(2).min(options.max_backoff)
    } else {
        options.interval
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: u64,
    pub data: HeartbeatData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub pid: u32,
    pub hostname: String,
    /// Global CPU usage, percent
    pub cpu_usage: f32,
    /// Resident memory of this process, bytes
    pub memory_used: u64,
    pub memory_total: u64,
}

/// Host and process statistics for the heartbeat payload.
struct Probe {
    system: System,
    pid: Option<Pid>,
    hostname: String,
}

impl Probe {
    fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            hostname: System::host_name().unwrap_or_default(),
        }
    }

    fn sample(&mut self) -> HeartbeatData {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        let memory_used = match self.pid {
            Some(pid) => {
                self.system.refresh_process(pid);
                self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        HeartbeatData {
            pid: std::process::id(),
            hostname: self.hostname.clone(),
            cpu_usage: self.system.global_cpu_info().cpu_usage(),
            memory_used,
            memory_total: self.system.total_memory(),
        }
    }
}

struct HeartbeatWriter {
    store: RedisStore,
    key: String,
    ttl: Duration,
    probe: Probe,
}

impl HeartbeatWriter {
    async fn beat(&mut self) -> Result<(), SmqError> {
        let payload = HeartbeatPayload {
            timestamp: crate::now_ms(),
            data: self.probe.sample(),
        };
        let _: () = self
            .store
            .conn()
            .set_ex(
                &self.key,
                serde_json::to_string(&payload)?,
                self.ttl.as_secs().max(1),
            )
            .await?;
        Ok(())
    }
}

/// Keeps a consumer's liveness key fresh.
pub struct Heartbeat {
    lifecycle: Lifecycle,
    store: RedisStore,
    consumer_id: String,
    options: HeartbeatOptions,
    events: EventBus,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Heartbeat {
    pub fn new(
        store: RedisStore,
        consumer_id: impl Into<String>,
        options: HeartbeatOptions,
        events: EventBus,
    ) -> Self {
        let consumer_id = consumer_id.into();
        Self {
            lifecycle: Lifecycle::new(format!("heartbeat:{consumer_id}")),
            store,
            consumer_id,
            options,
            events,
            worker: Mutex::new(None),
        }
    }
}

impl Runnable for Heartbeat {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_going_up(&self) -> Result<(), SmqError> {
        let mut writer = HeartbeatWriter {
            store: self.store.clone(),
            key: keys::heartbeat_key(&self.consumer_id),
            ttl: self.options.ttl,
            probe: Probe::new(),
        };
        // A consumer counts as alive from the moment it is up
        writer.beat().await?;

        let options = self.options.clone();
        let events = self.events.clone();
        let consumer_id = self.consumer_id.clone();

        let worker = WorkerHandle::spawn(
            format!("heartbeat:{consumer_id}"),
            move |mut shutdown_rx| async move {
                let mut delay = options.interval;
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = tokio::time::sleep(delay) => {
                            let failed = match writer.beat().await {
                                Ok(()) => false,
                                Err(e) => {
                                    tracing::warn!(consumer_id, error = ?e, "Heartbeat write failed");
                                    events.emit(ConsumerEvent::HeartbeatError {
                                        consumer_id: consumer_id.clone(),
                                        error: e.to_string(),
                                    });
                                    true
                                }
                            };
                            delay = next_delay(delay, failed, &options);
                        }
                    }
                }
                Ok(())
            },
        );
        *self.worker.lock().await = Some(worker);
        Ok(())
    }

    async fn on_going_down(&self) -> Result<(), SmqError> {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.shutdown().await?;
        }
        let deleted: Result<(), redis::RedisError> = self
            .store
            .conn()
            .del(keys::heartbeat_key(&self.consumer_id))
            .await;
        if let Err(e) = deleted {
            tracing::warn!(consumer_id = self.consumer_id, error = ?e, "Failed to delete heartbeat key");
        }
        Ok(())
    }
}

pub async fn get_heartbeat(
    store: &RedisStore,
    consumer_id: &str,
) -> Result<Option<HeartbeatPayload>, SmqError> {
    let payload: Option<String> = store.conn().get(keys::heartbeat_key(consumer_id)).await?;
    payload
        .map(|json| serde_json::from_str(&json).map_err(SmqError::from))
        .transpose()
}

pub async fn is_consumer_alive(store: &RedisStore, consumer_id: &str) -> Result<bool, SmqError> {
    let alive: bool = store
        .conn()
        .exists(keys::heartbeat_key(consumer_id))
        .await?;
    Ok(alive)
}

/// Liveness of many consumers with a single MGET.
pub async fn is_consumer_list_alive(
    store: &RedisStore,
    consumer_ids: &[String],
) -> Result<HashMap<String, bool>, SmqError> {
    if consumer_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let mut cmd = redis::cmd("MGET");
    for id in consumer_ids {
        cmd.arg(keys::heartbeat_key(id));
    }
    let values: Vec<Option<String>> = cmd.query_async(&mut store.conn()).await?;
    Ok(consumer_ids
        .iter()
        .cloned()
        .zip(values.into_iter().map(|v| v.is_some()))
        .collect())
}
