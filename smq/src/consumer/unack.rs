use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::StoreConfig,
    error::SmqError,
    keys::{self, ConsumerQueueKeys},
    message::{DeadLetterReason, Message, UnackReason},
    queue::ConsumerQueue,
    store::RedisStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnackAction {
    Delay,
    Requeue,
    DeadLetter,
}

impl UnackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnackAction::Delay => "DELAY",
            UnackAction::Requeue => "REQUEUE",
            UnackAction::DeadLetter => "DEAD_LETTER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnackDecision {
    pub action: UnackAction,
    pub dead_letter_reason: Option<DeadLetterReason>,
}

impl UnackDecision {
    fn dead_letter(reason: DeadLetterReason) -> Self {
        Self {
            action: UnackAction::DeadLetter,
            dead_letter_reason: Some(reason),
        }
    }

    fn retry(action: UnackAction) -> Self {
        Self {
            action,
            dead_letter_reason: None,
        }
    }
}

/// Message id → what happened to it.
pub type UnackStatus = HashMap<String, UnackDecision>;

/// What to do with a message handed back for `reason`. Checked in order, first match wins:
/// expiry, periodic messages, exhausted retries, retry delay, plain requeue.
pub fn decide_action(message: &Message, reason: UnackReason) -> UnackDecision {
    if reason == UnackReason::TtlExpired || message.state.expired {
        return UnackDecision::dead_letter(DeadLetterReason::TtlExpired);
    }
    // The next firing of the schedule replaces a failed periodic message
    if message.is_periodic() {
        return UnackDecision::dead_letter(DeadLetterReason::PeriodicMessage);
    }
    if message.has_retry_threshold_exceeded() {
        return UnackDecision::dead_letter(DeadLetterReason::RetryThresholdExceeded);
    }
    if message.retry_delay > 0 {
        return UnackDecision::retry(UnackAction::Delay);
    }
    UnackDecision::retry(UnackAction::Requeue)
}

/// Moves messages out of a consumer's processing list according to `decide_action`.
/// Each call is one script invocation per queue, so a batch either moves entirely or not at all.
#[derive(Clone)]
pub struct UnacknowledgementEngine {
    store: RedisStore,
    dead_lettered: StoreConfig,
}

impl UnacknowledgementEngine {
    pub fn new(store: RedisStore, dead_lettered: StoreConfig) -> Self {
        Self {
            store,
            dead_lettered,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(consumer_id = consumer_id, message_id = message.id, reason = reason.as_str()))]
    pub async fn unacknowledge_message(
        &self,
        consumer_id: &str,
        message: &Message,
        reason: UnackReason,
    ) -> Result<UnackStatus, SmqError> {
        let pending = vec![(message.id.clone(), Some(message))];
        self.apply(consumer_id, &message.destination, &pending, reason, false)
            .await
    }

    /// Hand back everything a consumer holds in processing.
    ///
    /// With `queues == None` the consumer's registered queues are used. `remove_consumer`
    /// also drops the consumer's registrations, in the same atomic step, for every queue.
    #[tracing::instrument(level = "debug", skip(self, queues, reason), fields(reason = reason.as_str()))]
    pub async fn unacknowledge_messages_in_process(
        &self,
        consumer_id: &str,
        queues: Option<&[ConsumerQueue]>,
        reason: UnackReason,
        remove_consumer: bool,
    ) -> Result<UnackStatus, SmqError> {
        let queues = match queues {
            Some(queues) => queues.to_vec(),
            None => self.consumer_queues(consumer_id).await?,
        };

        let mut status = UnackStatus::new();
        for target in &queues {
            let processing = ConsumerQueueKeys::new(target).processing(consumer_id);
            let ids: Vec<String> = redis::cmd("LRANGE")
                .arg(&processing)
                .arg(0)
                .arg(-1)
                .query_async(&mut self.store.conn())
                .await?;

            if ids.is_empty() && !remove_consumer {
                continue;
            }

            let records = self.fetch_messages(&target.queue.namespace, &ids).await?;
            let pending: Vec<(String, Option<&Message>)> = ids
                .iter()
                .cloned()
                .zip(records.iter().map(Option::as_ref))
                .collect();

            let decided = self
                .apply(consumer_id, target, &pending, reason, remove_consumer)
                .await?;
            status.extend(decided);
        }
        Ok(status)
    }

    async fn consumer_queues(&self, consumer_id: &str) -> Result<Vec<ConsumerQueue>, SmqError> {
        let members = self
            .store
            .sscan_all(&keys::consumer_queues_set(consumer_id))
            .await?;
        members
            .iter()
            .map(|json| serde_json::from_str(json).map_err(SmqError::from))
            .collect()
    }

    async fn fetch_messages(
        &self,
        namespace: &str,
        ids: &[String],
    ) -> Result<Vec<Option<Message>>, SmqError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(keys::message_key(namespace, id));
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut self.store.conn()).await?;

        maps.iter()
            .map(|map| {
                if map.is_empty() {
                    Ok(None)
                } else {
                    Message::from_hash(map).map(Some)
                }
            })
            .collect()
    }

    /// One script call for every message of one processing list. Ids without a record are
    /// only removed from the list.
    async fn apply(
        &self,
        consumer_id: &str,
        target: &ConsumerQueue,
        messages: &[(String, Option<&Message>)],
        reason: UnackReason,
        remove_consumer: bool,
    ) -> Result<UnackStatus, SmqError> {
        let keys = ConsumerQueueKeys::new(target);
        let namespace = &target.queue.namespace;
        let now = crate::now_ms();

        let script = &self.store.scripts().unacknowledge_messages;
        let mut invocation = script.prepare_invoke();
        invocation
            .key(keys.processing(consumer_id))
            .key(keys.delayed())
            .key(keys.requeued())
            .key(keys.queue.dead_lettered())
            .key(keys.queue.processing_queues())
            .key(keys.queue.consumers())
            .key(keys.queue.properties())
            .arg(UnackAction::Delay.as_str())
            .arg(UnackAction::Requeue.as_str())
            .arg(UnackAction::DeadLetter.as_str())
            .arg(self.dead_lettered.flag())
            .arg(self.dead_lettered.expire_ms)
            .arg(self.dead_lettered.queue_size)
            .arg(keys::message_key_prefix(namespace))
            .arg(now)
            .arg(consumer_id)
            .arg(if remove_consumer { "1" } else { "0" });

        let mut status = UnackStatus::new();
        for (id, message) in messages {
            let decision = match message {
                Some(message) => decide_action(message, reason),
                None => {
                    tracing::warn!(message_id = id, "Message record missing, dropping from processing");
                    UnackDecision::dead_letter(DeadLetterReason::RetryThresholdExceeded)
                }
            };
            let delay_until = match (decision.action, message) {
                (UnackAction::Delay, Some(message)) => now + message.retry_delay,
                _ => 0,
            };
            invocation
                .key(keys::message_key(namespace, id))
                .arg(id)
                .arg(decision.action.as_str())
                .arg(decision.dead_letter_reason.map(|r| r.as_str()).unwrap_or(""))
                .arg(reason.as_str())
                .arg(delay_until);
            if message.is_some() {
                status.insert(id.clone(), decision);
            }
        }

        let processed: usize = invocation.invoke_async(&mut self.store.conn()).await?;
        if processed != messages.len() {
            let error = SmqError::ProcessedCountMismatch {
                expected: messages.len(),
                processed,
            };
            tracing::error!(consumer_id, queue = %target, error = ?error, "Unacknowledgement moved an unexpected number of messages");
            return Err(error);
        }

        for (id, decision) in &status {
            tracing::debug!(
                consumer_id,
                queue = %target,
                message_id = id,
                action = decision.action.as_str(),
                dead_letter_reason = decision.dead_letter_reason.map(|r| r.as_str()),
                "Message unacknowledged"
            );
        }
        Ok(status)
    }
}
