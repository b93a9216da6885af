pub mod manager;
pub mod state;

use std::{collections::HashMap, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::{error::SmqError, rate_limit::QueueRateLimit};

pub use manager::QueueManager;
pub use state::{
    QueueStateManager, QueueStateReason, QueueStateTransition, TransitionOptions,
};

/// Field names of the queue properties hash. Lua scripts address the same fields.
pub(crate) mod fields {
    pub const TYPE: &str = "type";
    pub const DELIVERY_MODEL: &str = "delivery_model";
    pub const STATE: &str = "state";
    pub const STATE_CHANGED_AT: &str = "state_changed_at";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const PENDING_COUNT: &str = "pending_count";
    pub const PROCESSING_COUNT: &str = "processing_count";
    pub const SCHEDULED_COUNT: &str = "scheduled_count";
    pub const DELAYED_COUNT: &str = "delayed_count";
    pub const REQUEUED_COUNT: &str = "requeued_count";
    pub const DEAD_LETTERED_COUNT: &str = "dead_lettered_count";
    pub const ACKNOWLEDGED_COUNT: &str = "acknowledged_count";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueParams {
    pub namespace: String,
    pub name: String,
}

impl QueueParams {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Queue and namespace names are lowercase alphanumerics with `-`, `_` and `.` separators.
    pub fn validate(&self) -> Result<(), SmqError> {
        validate_name(&self.namespace, "namespace")?;
        validate_name(&self.name, "queue name")
    }
}

impl Display for QueueParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

pub(crate) fn validate_name(value: &str, what: &str) -> Result<(), SmqError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
    let starts_alnum = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric());

    if value.is_empty() || !valid_chars || !starts_alnum {
        return Err(SmqError::InvalidQueueParameters(format!(
            "invalid {what} '{value}'"
        )));
    }
    Ok(())
}

/// A delivery target: a queue plus, for pub/sub queues, the consumer group reading from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerQueue {
    pub queue: QueueParams,
    pub group_id: Option<String>,
}

impl ConsumerQueue {
    pub fn new(queue: QueueParams, group_id: Option<String>) -> Self {
        Self { queue, group_id }
    }

    pub fn validate(&self) -> Result<(), SmqError> {
        self.queue.validate()?;
        if let Some(group_id) = &self.group_id {
            validate_name(group_id, "consumer group id")?;
        }
        Ok(())
    }
}

impl From<QueueParams> for ConsumerQueue {
    fn from(queue: QueueParams) -> Self {
        Self::new(queue, None)
    }
}

impl Display for ConsumerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.group_id {
            Some(group_id) => write!(f, "{}#{}", self.queue, group_id),
            None => write!(f, "{}", self.queue),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueType {
    Fifo,
    Lifo,
    Priority,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Fifo => "FIFO",
            QueueType::Lifo => "LIFO",
            QueueType::Priority => "PRIORITY",
        }
    }
}

impl TryFrom<&str> for QueueType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "FIFO" => Ok(QueueType::Fifo),
            "LIFO" => Ok(QueueType::Lifo),
            "PRIORITY" => Ok(QueueType::Priority),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryModel {
    PointToPoint,
    PubSub,
}

impl DeliveryModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryModel::PointToPoint => "POINT_TO_POINT",
            DeliveryModel::PubSub => "PUB_SUB",
        }
    }
}

impl TryFrom<&str> for DeliveryModel {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "POINT_TO_POINT" => Ok(DeliveryModel::PointToPoint),
            "PUB_SUB" => Ok(DeliveryModel::PubSub),
            _ => Err(()),
        }
    }
}

/// Operational state of a queue. `Locked` is only ever set by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Active,
    Paused,
    Stopped,
    Locked,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Active => "ACTIVE",
            QueueState::Paused => "PAUSED",
            QueueState::Stopped => "STOPPED",
            QueueState::Locked => "LOCKED",
        }
    }
}

impl Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for QueueState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ACTIVE" => Ok(QueueState::Active),
            "PAUSED" => Ok(QueueState::Paused),
            "STOPPED" => Ok(QueueState::Stopped),
            "LOCKED" => Ok(QueueState::Locked),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub pending: i64,
    pub processing: i64,
    pub scheduled: i64,
    pub delayed: i64,
    pub requeued: i64,
    pub dead_lettered: i64,
    pub acknowledged: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueProperties {
    pub queue_type: QueueType,
    pub delivery_model: DeliveryModel,
    pub state: QueueState,
    pub state_changed_at: u64,
    pub rate_limit: Option<QueueRateLimit>,
    pub counters: QueueCounters,
}

impl QueueProperties {
    /// Parse the properties hash. Returns `None` when the hash is empty (queue does not exist).
    pub fn from_hash(map: &HashMap<String, String>) -> Result<Option<Self>, SmqError> {
        if map.is_empty() {
            return Ok(None);
        }

        let queue_type = map
            .get(fields::TYPE)
            .and_then(|s| QueueType::try_from(s.as_str()).ok())
            .ok_or_else(|| SmqError::UnexpectedScriptReply("queue type missing".into()))?;
        let delivery_model = map
            .get(fields::DELIVERY_MODEL)
            .and_then(|s| DeliveryModel::try_from(s.as_str()).ok())
            .unwrap_or(DeliveryModel::PointToPoint);
        let state = map
            .get(fields::STATE)
            .and_then(|s| QueueState::try_from(s.as_str()).ok())
            .unwrap_or(QueueState::Active);
        let state_changed_at = parse_field(map, fields::STATE_CHANGED_AT) as u64;

        let rate_limit = match map.get(fields::RATE_LIMIT) {
            Some(json) if !json.is_empty() => Some(serde_json::from_str(json)?),
            _ => None,
        };

        let counters = QueueCounters {
            pending: parse_field(map, fields::PENDING_COUNT),
            processing: parse_field(map, fields::PROCESSING_COUNT),
            scheduled: parse_field(map, fields::SCHEDULED_COUNT),
            delayed: parse_field(map, fields::DELAYED_COUNT),
            requeued: parse_field(map, fields::REQUEUED_COUNT),
            dead_lettered: parse_field(map, fields::DEAD_LETTERED_COUNT),
            acknowledged: parse_field(map, fields::ACKNOWLEDGED_COUNT),
        };

        Ok(Some(Self {
            queue_type,
            delivery_model,
            state,
            state_changed_at,
            rate_limit,
            counters,
        }))
    }
}

fn parse_field(map: &HashMap<String, String>, field: &str) -> i64 {
    map.get(field).and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_validated() {
        assert!(QueueParams::new("default", "orders.v2").validate().is_ok());
        assert!(QueueParams::new("default", "Orders").validate().is_err());
        assert!(QueueParams::new("", "orders").validate().is_err());
        assert!(QueueParams::new("default", "-orders").validate().is_err());

        let target = ConsumerQueue::new(QueueParams::new("default", "orders"), Some("a b".into()));
        assert!(matches!(
            target.validate(),
            Err(SmqError::InvalidQueueParameters(_))
        ));
    }

    #[test]
    fn properties_parse_defaults_missing_counters() {
        let mut map = HashMap::new();
        assert!(QueueProperties::from_hash(&map).unwrap().is_none());

        map.insert("type".to_string(), "PRIORITY".to_string());
        map.insert("delivery_model".to_string(), "PUB_SUB".to_string());
        map.insert("state".to_string(), "PAUSED".to_string());
        map.insert("pending_count".to_string(), "4".to_string());
        map.insert(
            "rate_limit".to_string(),
            r#"{"limit":10,"interval":2000}"#.to_string(),
        );

        let props = QueueProperties::from_hash(&map).unwrap().unwrap();
        assert_eq!(props.queue_type, QueueType::Priority);
        assert_eq!(props.delivery_model, DeliveryModel::PubSub);
        assert_eq!(props.state, QueueState::Paused);
        assert_eq!(props.counters.pending, 4);
        assert_eq!(props.counters.acknowledged, 0);
        assert_eq!(
            props.rate_limit,
            Some(QueueRateLimit {
                limit: 10,
                interval: 2000
            })
        );
    }
}
