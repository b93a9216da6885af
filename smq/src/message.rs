use std::{collections::HashMap, fmt::Display, time::Duration};

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

use crate::{
    error::SmqError,
    queue::{ConsumerQueue, QueueParams},
};

pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 60_000;

/// Field names of the message record hash. Lua scripts address the same fields.
pub(crate) mod fields {
    pub const ID: &str = "id";
    pub const NAMESPACE: &str = "namespace";
    pub const QUEUE: &str = "queue";
    pub const GROUP: &str = "group";
    pub const BODY: &str = "body";
    pub const PRIORITY: &str = "priority";
    pub const TTL: &str = "ttl";
    pub const RETRY_THRESHOLD: &str = "retry_threshold";
    pub const RETRY_DELAY: &str = "retry_delay";
    pub const CONSUME_TIMEOUT: &str = "consume_timeout";
    pub const SCHEDULE_DELAY: &str = "schedule_delay";
    pub const REPEAT: &str = "repeat";
    pub const REPEAT_PERIOD: &str = "repeat_period";
    pub const SCHEDULED_MESSAGE_ID: &str = "scheduled_message_id";
    pub const STATUS: &str = "status";
    pub const ATTEMPTS: &str = "attempts";
    pub const PUBLISHED_AT: &str = "published_at";
    pub const SCHEDULED_AT: &str = "scheduled_at";
    pub const PROCESSING_STARTED_AT: &str = "processing_started_at";
    pub const ACKNOWLEDGED_AT: &str = "acknowledged_at";
    pub const UNACKNOWLEDGED_AT: &str = "unacknowledged_at";
    pub const DEAD_LETTERED_AT: &str = "dead_lettered_at";
    pub const REQUEUED_AT: &str = "requeued_at";
    pub const EXPIRED: &str = "expired";
    pub const FIRED_COUNT: &str = "fired_count";
    pub const LAST_UNACKNOWLEDGED_REASON: &str = "last_unacknowledged_reason";
    pub const DEAD_LETTER_REASON: &str = "dead_letter_reason";
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ();

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Scheduled,
    Pending,
    Processing,
    Acknowledged,
    UnackRequeuing,
    UnackDelaying,
    DeadLettered,
    Expired,
}

string_enum!(MessageStatus {
    Scheduled => "SCHEDULED",
    Pending => "PENDING",
    Processing => "PROCESSING",
    Acknowledged => "ACKNOWLEDGED",
    UnackRequeuing => "UNACK_REQUEUING",
    UnackDelaying => "UNACK_DELAYING",
    DeadLettered => "DEAD_LETTERED",
    Expired => "EXPIRED",
});

/// Why a message was handed back by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnackReason {
    ConsumeError,
    Timeout,
    TtlExpired,
    OfflineConsumer,
    OfflineMessageHandler,
}

string_enum!(UnackReason {
    ConsumeError => "CONSUME_ERROR",
    Timeout => "TIMEOUT",
    TtlExpired => "TTL_EXPIRED",
    OfflineConsumer => "OFFLINE_CONSUMER",
    OfflineMessageHandler => "OFFLINE_MESSAGE_HANDLER",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    TtlExpired,
    PeriodicMessage,
    RetryThresholdExceeded,
}

string_enum!(DeadLetterReason {
    TtlExpired => "TTL_EXPIRED",
    PeriodicMessage => "PERIODIC_MESSAGE",
    RetryThresholdExceeded => "RETRY_THRESHOLD_EXCEEDED",
});

/// Lower values are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Highest = 0,
    VeryHigh = 1,
    High = 2,
    AboveNormal = 3,
    Normal = 4,
    BelowNormal = 5,
    Low = 6,
    Lowest = 7,
}

impl MessagePriority {
    pub fn score(&self) -> u8 {
        *self as u8
    }

    pub fn from_score(score: u8) -> Option<Self> {
        use MessagePriority::*;
        [
            Highest,
            VeryHigh,
            High,
            AboveNormal,
            Normal,
            BelowNormal,
            Low,
            Lowest,
        ]
        .get(score as usize)
        .copied()
    }
}

/// Mutable delivery metadata of a message. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    /// Number of times the message has been unacknowledged and retried
    pub attempts: u32,
    pub published_at: u64,
    pub scheduled_at: Option<u64>,
    pub processing_started_at: Option<u64>,
    pub acknowledged_at: Option<u64>,
    pub unacknowledged_at: Option<u64>,
    pub dead_lettered_at: Option<u64>,
    pub requeued_at: Option<u64>,
    pub expired: bool,
    /// Firings so far, only tracked on the origin of a repeating message
    pub fired_count: u32,
    pub last_unacknowledged_reason: Option<UnackReason>,
    pub dead_letter_reason: Option<DeadLetterReason>,
}

impl MessageState {
    pub fn new(published_at: u64) -> Self {
        Self {
            published_at,
            ..Default::default()
        }
    }

    /// TTL counts from the last scheduling, or from publication for unscheduled messages.
    pub fn has_expired(&self, ttl: u64, now: u64) -> bool {
        if self.expired {
            return true;
        }
        if ttl == 0 {
            return false;
        }
        let start = self.scheduled_at.unwrap_or(self.published_at);
        start.saturating_add(ttl) <= now
    }

    pub fn mark_expired(&mut self) {
        self.expired = true;
    }

    pub fn mark_processing(&mut self, now: u64) {
        self.processing_started_at = Some(now);
    }

    pub fn increment_attempts(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub destination: ConsumerQueue,
    pub body: serde_json::Value,
    pub status: MessageStatus,
    pub priority: Option<MessagePriority>,
    /// Milliseconds, 0 = never expires
    pub ttl: u64,
    pub retry_threshold: u32,
    /// Milliseconds between an unacknowledgement and the next delivery, 0 = requeue immediately
    pub retry_delay: u64,
    /// Milliseconds, 0 = no limit
    pub consume_timeout: u64,
    pub schedule_delay: u64,
    /// Extra firings after the first one
    pub repeat: u32,
    pub repeat_period: u64,
    /// Origin of a message minted by a repeating schedule
    pub scheduled_message_id: Option<String>,
    pub state: MessageState,
}

impl Message {
    pub fn is_periodic(&self) -> bool {
        self.repeat > 0
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule_delay > 0 || self.is_periodic()
    }

    pub fn has_expired(&self, now: u64) -> bool {
        self.state.has_expired(self.ttl, now)
    }

    pub fn has_retry_threshold_exceeded(&self) -> bool {
        self.state.attempts >= self.retry_threshold
    }

    /// When the next firing of a repeating origin should happen, or `None` when it is done.
    pub fn next_fire_at(&self, now: u64) -> Option<u64> {
        if self.is_periodic() && self.state.fired_count < self.repeat {
            Some(now.saturating_add(self.repeat_period))
        } else {
            None
        }
    }

    /// A fresh message for one firing of this repeating origin.
    pub fn spawn_child(&self, now: u64) -> Message {
        Message {
            id: nanoid!(),
            status: MessageStatus::Pending,
            scheduled_message_id: Some(self.id.clone()),
            state: MessageState {
                scheduled_at: Some(now),
                ..MessageState::new(now)
            },
            ..self.clone()
        }
    }

    /// Flattened `field, value` pairs for HSET.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (fields::ID, self.id.clone()),
            (fields::NAMESPACE, self.destination.queue.namespace.clone()),
            (fields::QUEUE, self.destination.queue.name.clone()),
            (fields::BODY, self.body.to_string()),
            (fields::TTL, self.ttl.to_string()),
            (fields::RETRY_THRESHOLD, self.retry_threshold.to_string()),
            (fields::RETRY_DELAY, self.retry_delay.to_string()),
            (fields::CONSUME_TIMEOUT, self.consume_timeout.to_string()),
            (fields::SCHEDULE_DELAY, self.schedule_delay.to_string()),
            (fields::REPEAT, self.repeat.to_string()),
            (fields::REPEAT_PERIOD, self.repeat_period.to_string()),
            (fields::STATUS, self.status.to_string()),
            (fields::ATTEMPTS, self.state.attempts.to_string()),
            (fields::PUBLISHED_AT, self.state.published_at.to_string()),
            (fields::EXPIRED, (self.state.expired as u8).to_string()),
            (fields::FIRED_COUNT, self.state.fired_count.to_string()),
        ];

        let optional = [
            (fields::GROUP, self.destination.group_id.clone()),
            (fields::PRIORITY, self.priority.map(|p| p.score().to_string())),
            (fields::SCHEDULED_MESSAGE_ID, self.scheduled_message_id.clone()),
            (fields::SCHEDULED_AT, self.state.scheduled_at.map(|t| t.to_string())),
            (
                fields::PROCESSING_STARTED_AT,
                self.state.processing_started_at.map(|t| t.to_string()),
            ),
            (
                fields::ACKNOWLEDGED_AT,
                self.state.acknowledged_at.map(|t| t.to_string()),
            ),
            (
                fields::UNACKNOWLEDGED_AT,
                self.state.unacknowledged_at.map(|t| t.to_string()),
            ),
            (
                fields::DEAD_LETTERED_AT,
                self.state.dead_lettered_at.map(|t| t.to_string()),
            ),
            (fields::REQUEUED_AT, self.state.requeued_at.map(|t| t.to_string())),
            (
                fields::LAST_UNACKNOWLEDGED_REASON,
                self.state.last_unacknowledged_reason.map(|r| r.to_string()),
            ),
            (
                fields::DEAD_LETTER_REASON,
                self.state.dead_letter_reason.map(|r| r.to_string()),
            ),
        ];
        out.extend(
            optional
                .into_iter()
                .filter_map(|(field, value)| value.map(|v| (field, v))),
        );
        out
    }

    pub fn from_hash(map: &HashMap<String, String>) -> Result<Self, SmqError> {
        let required = |field: &str| {
            map.get(field).cloned().ok_or_else(|| {
                SmqError::UnexpectedScriptReply(format!("message record is missing '{field}'"))
            })
        };
        let number = |field: &str| -> u64 {
            map.get(field).and_then(|s| s.parse().ok()).unwrap_or(0)
        };
        let optional_number =
            |field: &str| -> Option<u64> { map.get(field).and_then(|s| s.parse().ok()) };

        let id = required(fields::ID)?;
        let queue = QueueParams::new(required(fields::NAMESPACE)?, required(fields::QUEUE)?);
        let group_id = map.get(fields::GROUP).filter(|g| !g.is_empty()).cloned();
        let body = serde_json::from_str(&required(fields::BODY)?)?;
        let status = MessageStatus::try_from(required(fields::STATUS)?.as_str()).map_err(|_| {
            SmqError::UnexpectedScriptReply(format!("message {id} has an unknown status"))
        })?;

        let state = MessageState {
            attempts: number(fields::ATTEMPTS) as u32,
            published_at: number(fields::PUBLISHED_AT),
            scheduled_at: optional_number(fields::SCHEDULED_AT),
            processing_started_at: optional_number(fields::PROCESSING_STARTED_AT),
            acknowledged_at: optional_number(fields::ACKNOWLEDGED_AT),
            unacknowledged_at: optional_number(fields::UNACKNOWLEDGED_AT),
            dead_lettered_at: optional_number(fields::DEAD_LETTERED_AT),
            requeued_at: optional_number(fields::REQUEUED_AT),
            expired: number(fields::EXPIRED) == 1,
            fired_count: number(fields::FIRED_COUNT) as u32,
            last_unacknowledged_reason: map
                .get(fields::LAST_UNACKNOWLEDGED_REASON)
                .and_then(|s| UnackReason::try_from(s.as_str()).ok()),
            dead_letter_reason: map
                .get(fields::DEAD_LETTER_REASON)
                .and_then(|s| DeadLetterReason::try_from(s.as_str()).ok()),
        };

        Ok(Self {
            id,
            destination: ConsumerQueue::new(queue, group_id),
            body,
            status,
            priority: optional_number(fields::PRIORITY)
                .and_then(|p| MessagePriority::from_score(p as u8)),
            ttl: number(fields::TTL),
            retry_threshold: map
                .get(fields::RETRY_THRESHOLD)
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_THRESHOLD),
            retry_delay: number(fields::RETRY_DELAY),
            consume_timeout: number(fields::CONSUME_TIMEOUT),
            schedule_delay: number(fields::SCHEDULE_DELAY),
            repeat: number(fields::REPEAT) as u32,
            repeat_period: number(fields::REPEAT_PERIOD),
            scheduled_message_id: map
                .get(fields::SCHEDULED_MESSAGE_ID)
                .filter(|s| !s.is_empty())
                .cloned(),
            state,
        })
    }
}

/// A message ready to be handed to a `Producer`.
#[derive(Debug, Clone)]
pub struct ProducibleMessage {
    pub body: serde_json::Value,
    pub queue: QueueParams,
    /// Restrict a pub/sub publication to one consumer group
    pub group_id: Option<String>,
    pub priority: Option<MessagePriority>,
    pub ttl: Duration,
    pub retry_threshold: u32,
    pub retry_delay: Duration,
    pub consume_timeout: Duration,
    pub schedule_delay: Duration,
    pub repeat: u32,
    pub repeat_period: Duration,
}

impl ProducibleMessage {
    pub fn new(queue: QueueParams, body: serde_json::Value) -> Self {
        Self {
            body,
            queue,
            group_id: None,
            priority: None,
            ttl: Duration::ZERO,
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            consume_timeout: Duration::ZERO,
            schedule_delay: Duration::ZERO,
            repeat: 0,
            repeat_period: Duration::ZERO,
        }
    }

    pub fn json<T: Serialize>(queue: QueueParams, body: &T) -> Result<Self, SmqError> {
        Ok(Self::new(queue, serde_json::to_value(body)?))
    }

    pub fn with_consumer_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry_threshold(mut self, threshold: u32) -> Self {
        self.retry_threshold = threshold;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.consume_timeout = timeout;
        self
    }

    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay = delay;
        self
    }

    /// Publish `repeat` more times after the first firing, `period` apart.
    pub fn with_repeat(mut self, repeat: u32, period: Duration) -> Self {
        self.repeat = repeat;
        self.repeat_period = period;
        self
    }

    pub fn validate(&self) -> Result<(), SmqError> {
        self.queue.validate()?;
        if self.retry_threshold == 0 {
            return Err(SmqError::InvalidMessage(
                "retry threshold must be at least 1".into(),
            ));
        }
        if self.repeat > 0 && self.repeat_period.is_zero() {
            return Err(SmqError::InvalidMessage(
                "a repeating message needs a repeat period".into(),
            ));
        }
        Ok(())
    }

    /// Build the stored record for one delivery target.
    pub(crate) fn into_message(&self, destination: ConsumerQueue, now: u64) -> Message {
        let scheduled = !self.schedule_delay.is_zero() || self.repeat > 0;
        Message {
            id: nanoid!(),
            destination,
            body: self.body.clone(),
            status: if scheduled {
                MessageStatus::Scheduled
            } else {
                MessageStatus::Pending
            },
            priority: self.priority,
            ttl: self.ttl.as_millis() as u64,
            retry_threshold: self.retry_threshold,
            retry_delay: self.retry_delay.as_millis() as u64,
            consume_timeout: self.consume_timeout.as_millis() as u64,
            schedule_delay: self.schedule_delay.as_millis() as u64,
            repeat: self.repeat,
            repeat_period: self.repeat_period.as_millis() as u64,
            scheduled_message_id: None,
            state: MessageState {
                scheduled_at: scheduled.then(|| now + self.schedule_delay.as_millis() as u64),
                ..MessageState::new(now)
            },
        }
    }
}
