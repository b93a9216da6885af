use std::collections::HashMap;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::{
    error::SmqError,
    keys::{self, QueueKeys},
    queue::{QueueParams, QueueState},
    store::RedisStore,
};

pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStateReason {
    Manual,
    Scheduled,
    Emergency,
    Performance,
    Recovery,
    Maintenance,
    SystemInit,
}

impl QueueStateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStateReason::Manual => "MANUAL",
            QueueStateReason::Scheduled => "SCHEDULED",
            QueueStateReason::Emergency => "EMERGENCY",
            QueueStateReason::Performance => "PERFORMANCE",
            QueueStateReason::Recovery => "RECOVERY",
            QueueStateReason::Maintenance => "MAINTENANCE",
            QueueStateReason::SystemInit => "SYSTEM_INIT",
        }
    }
}

/// One entry of a queue's state history, as stored and as broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStateTransition {
    pub from: QueueState,
    pub to: QueueState,
    pub reason: QueueStateReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    pub description: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl TransitionOptions {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

/// Transition rules. `system` transitions may enter and leave `Locked`.
pub fn validate_transition(
    from: QueueState,
    to: QueueState,
    system: bool,
) -> Result<(), SmqError> {
    if from == to {
        return Err(SmqError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if !system && (from == QueueState::Locked || to == QueueState::Locked) {
        return Err(SmqError::QueueLocked(format!("{from} -> {to}")));
    }
    Ok(())
}

/// Applies queue state transitions. Every transition goes through one script which
/// serializes it per queue, appends it to the bounded history and publishes it.
#[derive(Clone)]
pub struct QueueStateManager {
    store: RedisStore,
    max_history: usize,
}

impl QueueStateManager {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    pub async fn current(&self, queue: &QueueParams) -> Result<QueueState, SmqError> {
        let state: Option<String> = self
            .store
            .conn()
            .hget(QueueKeys::new(queue).properties(), crate::queue::fields::STATE)
            .await?;
        match state {
            Some(state) => QueueState::try_from(state.as_str()).map_err(|_| {
                SmqError::UnexpectedScriptReply(format!("unknown queue state '{state}'"))
            }),
            None => Err(SmqError::QueueNotFound(queue.to_string())),
        }
    }

    /// User initiated transition. `Locked` can be neither entered nor left this way.
    pub async fn transition(
        &self,
        queue: &QueueParams,
        to: QueueState,
        reason: QueueStateReason,
        options: TransitionOptions,
    ) -> Result<QueueStateTransition, SmqError> {
        if to == QueueState::Locked {
            return Err(SmqError::QueueLocked(queue.to_string()));
        }
        self.apply(queue, to, reason, options, false, None).await
    }

    pub async fn pause(
        &self,
        queue: &QueueParams,
        reason: QueueStateReason,
    ) -> Result<QueueStateTransition, SmqError> {
        self.transition(queue, QueueState::Paused, reason, TransitionOptions::default())
            .await
    }

    pub async fn stop(
        &self,
        queue: &QueueParams,
        reason: QueueStateReason,
    ) -> Result<QueueStateTransition, SmqError> {
        self.transition(queue, QueueState::Stopped, reason, TransitionOptions::default())
            .await
    }

    pub async fn activate(
        &self,
        queue: &QueueParams,
        reason: QueueStateReason,
    ) -> Result<QueueStateTransition, SmqError> {
        self.transition(queue, QueueState::Active, reason, TransitionOptions::default())
            .await
    }

    /// System lock, e.g. while a queue is being migrated.
    pub async fn lock(
        &self,
        queue: &QueueParams,
        reason: QueueStateReason,
        options: TransitionOptions,
    ) -> Result<QueueStateTransition, SmqError> {
        self.apply(queue, QueueState::Locked, reason, options, true, None)
            .await
    }

    /// Leave `Locked` for `Active`. Fails unless the queue is currently locked.
    pub async fn unlock(
        &self,
        queue: &QueueParams,
        reason: QueueStateReason,
    ) -> Result<QueueStateTransition, SmqError> {
        self.apply(
            queue,
            QueueState::Active,
            reason,
            TransitionOptions::default(),
            true,
            Some(QueueState::Locked),
        )
        .await
    }

    /// Most recent first.
    pub async fn history(
        &self,
        queue: &QueueParams,
    ) -> Result<Vec<QueueStateTransition>, SmqError> {
        let records: Vec<String> = self
            .store
            .conn()
            .lrange(QueueKeys::new(queue).state_history(), 0, -1)
            .await?;
        records
            .iter()
            .map(|json| serde_json::from_str(json).map_err(SmqError::from))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, options), fields(queue = %queue, to = %to))]
    async fn apply(
        &self,
        queue: &QueueParams,
        to: QueueState,
        reason: QueueStateReason,
        options: TransitionOptions,
        system: bool,
        expected_from: Option<QueueState>,
    ) -> Result<QueueStateTransition, SmqError> {
        let keys = QueueKeys::new(queue);
        let metadata = match &options.metadata {
            Some(metadata) => serde_json::to_string(metadata)?,
            None => String::new(),
        };

        let (status, payload): (String, String) = self
            .store
            .scripts()
            .set_queue_state
            .key(keys.properties())
            .key(keys.state_history())
            .arg(to.as_str())
            .arg(reason.as_str())
            .arg(options.description.as_deref().unwrap_or(""))
            .arg(metadata)
            .arg(crate::now_ms())
            .arg(self.max_history)
            .arg(keys::queue_state_channel())
            .arg(serde_json::to_string(queue)?)
            .arg(if system { "1" } else { "0" })
            .arg(expected_from.map(|s| s.as_str()).unwrap_or(""))
            .invoke_async(&mut self.store.conn())
            .await?;

        match status.as_str() {
            "OK" => {
                let transition: QueueStateTransition = serde_json::from_str(&payload)?;
                tracing::info!(
                    from = %transition.from,
                    reason = reason.as_str(),
                    "Queue state changed"
                );
                Ok(transition)
            }
            "QUEUE_NOT_FOUND" => Err(SmqError::QueueNotFound(queue.to_string())),
            "INVALID_TRANSITION" | "QUEUE_LOCKED" => {
                let from = QueueState::try_from(payload.as_str()).map_err(|_| {
                    SmqError::UnexpectedScriptReply(format!("unknown queue state '{payload}'"))
                })?;
                validate_transition(from, to, system)?;
                // Rules allow it, so the queue was not in the expected state
                Err(SmqError::InvalidStateTransition {
                    from: payload,
                    to: to.to_string(),
                })
            }
            other => Err(SmqError::UnexpectedScriptReply(format!(
                "set_queue_state returned '{other}'"
            ))),
        }
    }
}
