mod fixtures;
use fixtures::*;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::{future::Future, pin::Pin, time::Duration};

use smq::{
    Consumer, ConsumerEvent, DeliveryModel, Message, MessagePriority, MessageStatus, Producer,
    ProducibleMessage, QueueManager, QueueType, Runnable,
    config::StoreConfig,
    consumer::{ConsumeError, ConsumeResult, unack::UnackAction},
    message::DeadLetterReason,
};

type HandlerFuture = Pin<Box<dyn Future<Output = ConsumeResult> + Send>>;

fn counting_handler(
    calls: Arc<AtomicUsize>,
    fail_first: usize,
) -> impl Fn(Message) -> HandlerFuture + Send + Sync + 'static {
    move |_message: Message| -> HandlerFuture {
        let calls = calls.clone();
        Box::pin(async move {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            let result: ConsumeResult = if call < fail_first {
                Err(format!("attempt {call} failed").into())
            } else {
                Ok(())
            };
            result
        })
    }
}

fn is_final(event: &ConsumerEvent) -> bool {
    matches!(
        event,
        ConsumerEvent::MessageAcknowledged { .. }
            | ConsumerEvent::MessageUnacknowledged {
                action: UnackAction::DeadLetter,
                ..
            }
    )
}

fn unack_actions(events: &[ConsumerEvent]) -> Vec<UnackAction> {
    events
        .iter()
        .filter_map(|event| match event {
            ConsumerEvent::MessageUnacknowledged { action, .. } => Some(*action),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acknowledged_message_is_archived() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "orders", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let mut options = fast_options();
    options.messages.store.acknowledged = StoreConfig::enabled(10, 0);
    let consumer = Consumer::new(store.clone(), options).unwrap();
    let mut events = consumer.subscribe_events();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    consumer
        .consume(queue.clone(), move |message: Message| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message.body.clone());
                Ok::<(), ConsumeError>(())
            }
        })
        .await
        .unwrap();
    consumer.run().await.unwrap();

    let producer = Producer::new(store.clone());
    let ids = producer
        .produce(ProducibleMessage::new(queue.clone(), serde_json::json!({"order": 42})))
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let seen = collect_events_until(&mut events, Duration::from_secs(5), is_final).await;
    assert!(matches!(seen.last(), Some(ConsumerEvent::MessageAcknowledged { .. })));
    assert_eq!(*received.lock().unwrap(), vec![serde_json::json!({"order": 42})]);

    let manager = QueueManager::new(store.clone());
    let archived = manager.get_acknowledged_ids(&queue, 10).await.unwrap();
    assert_eq!(archived, ids);
    assert!(manager.get_acknowledged_ids(&queue, 0).await.unwrap().is_empty());
    assert_eq!(manager.get_acknowledged_ids(&queue, 1).await.unwrap(), ids);
    let record = manager.get_message(&namespace, &ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Acknowledged);
    assert!(record.state.acknowledged_at.is_some());

    let counters = manager.counters(&queue).await.unwrap();
    assert_eq!(counters.acknowledged, 1);
    assert_eq!(counters.pending, 0);
    assert_eq!(counters.processing, 0);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_message_is_dead_lettered_without_delivery() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "expiring", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let producer = Producer::new(store.clone());
    let ids = producer
        .produce(
            ProducibleMessage::new(queue.clone(), serde_json::json!("stale"))
                .with_ttl(Duration::from_millis(1000)),
        )
        .await
        .unwrap();

    // Nobody consumes until the TTL has passed
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut options = fast_options();
    options.messages.store.dead_lettered = StoreConfig::enabled(0, 0);
    let consumer = Consumer::new(store.clone(), options).unwrap();
    let mut events = consumer.subscribe_events();
    let calls = Arc::new(AtomicUsize::new(0));
    consumer
        .consume(queue.clone(), counting_handler(calls.clone(), 0))
        .await
        .unwrap();
    consumer.run().await.unwrap();

    let seen = collect_events_until(&mut events, Duration::from_secs(5), is_final).await;
    match seen.last() {
        Some(ConsumerEvent::MessageUnacknowledged {
            action,
            dead_letter_reason,
            ..
        }) => {
            assert_eq!(*action, UnackAction::DeadLetter);
            assert_eq!(*dead_letter_reason, Some(DeadLetterReason::TtlExpired));
        }
        other => panic!("Expected a dead-letter event, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0, "Handler must not see expired messages");

    let manager = QueueManager::new(store.clone());
    assert_eq!(manager.get_dead_lettered_ids(&queue, 10).await.unwrap(), ids);
    let record = manager.get_message(&namespace, &ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::DeadLettered);
    assert_eq!(record.state.dead_letter_reason, Some(DeadLetterReason::TtlExpired));
    assert!(record.state.expired);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_are_requeued_until_success() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "flaky", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    let mut events = consumer.subscribe_events();
    let calls = Arc::new(AtomicUsize::new(0));
    consumer
        .consume(queue.clone(), counting_handler(calls.clone(), 2))
        .await
        .unwrap();
    consumer.run().await.unwrap();

    Producer::new(store.clone())
        .produce(
            ProducibleMessage::new(queue.clone(), serde_json::json!(1))
                .with_retry_threshold(3)
                .with_retry_delay(Duration::ZERO),
        )
        .await
        .unwrap();

    let seen = collect_events_until(&mut events, Duration::from_secs(10), is_final).await;
    assert_eq!(
        unack_actions(&seen),
        vec![UnackAction::Requeue, UnackAction::Requeue]
    );
    assert!(matches!(seen.last(), Some(ConsumerEvent::MessageAcknowledged { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let counters = QueueManager::new(store.clone()).counters(&queue).await.unwrap();
    assert_eq!(counters.dead_lettered, 0);
    assert_eq!(counters.acknowledged, 1);
    assert_eq!(counters.requeued, 0);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_threshold_dead_letters() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "doomed", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let mut options = fast_options();
    options.messages.store.dead_lettered = StoreConfig::enabled(0, 0);
    let consumer = Consumer::new(store.clone(), options).unwrap();
    let mut events = consumer.subscribe_events();
    let calls = Arc::new(AtomicUsize::new(0));
    consumer
        .consume(queue.clone(), counting_handler(calls.clone(), usize::MAX))
        .await
        .unwrap();
    consumer.run().await.unwrap();

    let ids = Producer::new(store.clone())
        .produce(
            ProducibleMessage::new(queue.clone(), serde_json::json!(1))
                .with_retry_threshold(2)
                .with_retry_delay(Duration::ZERO),
        )
        .await
        .unwrap();

    let seen = collect_events_until(&mut events, Duration::from_secs(10), is_final).await;
    assert_eq!(
        unack_actions(&seen),
        vec![
            UnackAction::Requeue,
            UnackAction::Requeue,
            UnackAction::DeadLetter
        ]
    );
    assert!(matches!(
        seen.last(),
        Some(ConsumerEvent::MessageUnacknowledged {
            dead_letter_reason: Some(DeadLetterReason::RetryThresholdExceeded),
            ..
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let manager = QueueManager::new(store.clone());
    let record = manager.get_message(&namespace, &ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::DeadLettered);
    assert_eq!(record.state.attempts, 2);

    // A dead-lettered message never comes back
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_retry_preserves_attempts() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "delayed", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    let mut events = consumer.subscribe_events();
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = deliveries.clone();
    consumer
        .consume(queue.clone(), move |message: Message| {
            let sink = sink.clone();
            async move {
                let mut deliveries = sink.lock().unwrap();
                deliveries.push((
                    message.state.attempts,
                    message.state.processing_started_at,
                    smq_now(),
                ));
                let result: ConsumeResult = if deliveries.len() == 1 {
                    Err("first delivery fails".into())
                } else {
                    Ok(())
                };
                result
            }
        })
        .await
        .unwrap();
    consumer.run().await.unwrap();

    Producer::new(store.clone())
        .produce(
            ProducibleMessage::new(queue.clone(), serde_json::json!(1))
                .with_retry_delay(Duration::from_millis(500)),
        )
        .await
        .unwrap();

    let seen = collect_events_until(&mut events, Duration::from_secs(10), is_final).await;
    assert_eq!(unack_actions(&seen), vec![UnackAction::Delay]);
    assert!(matches!(seen.last(), Some(ConsumerEvent::MessageAcknowledged { .. })));

    let deliveries = deliveries.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 2);
    let (first_attempts, first_started, first_at) = deliveries[0];
    let (second_attempts, second_started, second_at) = deliveries[1];
    assert_eq!(first_attempts, 0);
    assert_eq!(second_attempts, 1);
    assert!(second_started > first_started, "Processing start is refreshed");
    assert!(second_at - first_at >= 450, "Retry waited for the delay");

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_consumers_deliver_once() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "shared", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let first = Consumer::new(store.clone(), fast_options()).unwrap();
    let second = Consumer::new(store.clone(), fast_options()).unwrap();
    for consumer in [&first, &second] {
        consumer
            .consume(queue.clone(), counting_handler(calls.clone(), 0))
            .await
            .unwrap();
        consumer.run().await.unwrap();
    }

    Producer::new(store.clone())
        .produce(ProducibleMessage::new(queue.clone(), serde_json::json!("once")))
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || async { calls.load(Ordering::SeqCst) >= 1 }).await);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let counters = QueueManager::new(store.clone()).counters(&queue).await.unwrap();
    assert_eq!(counters.acknowledged, 1);

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_priority_queue_delivers_highest_first() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "ranked", QueueType::Priority, DeliveryModel::PointToPoint).await;

    let producer = Producer::new(store.clone());
    for (body, priority) in [
        ("low", MessagePriority::Low),
        ("highest", MessagePriority::Highest),
        ("normal", MessagePriority::Normal),
    ] {
        producer
            .produce(ProducibleMessage::new(queue.clone(), serde_json::json!(body)).with_priority(priority))
            .await
            .unwrap();
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    consumer
        .consume(queue.clone(), move |message: Message| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .unwrap()
                    .push(message.body.as_str().unwrap_or_default().to_string());
                Ok::<(), ConsumeError>(())
            }
        })
        .await
        .unwrap();
    consumer.run().await.unwrap();

    assert!(wait_for(Duration::from_secs(5), || async { order.lock().unwrap().len() == 3 }).await);
    assert_eq!(*order.lock().unwrap(), vec!["highest", "normal", "low"]);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pubsub_delivers_to_every_group() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "broadcast", QueueType::Fifo, DeliveryModel::PubSub).await;

    let manager = QueueManager::new(store.clone());
    manager.save_consumer_group(&queue, "audit").await.unwrap();
    manager.save_consumer_group(&queue, "billing").await.unwrap();

    let audit_calls = Arc::new(AtomicUsize::new(0));
    let billing_calls = Arc::new(AtomicUsize::new(0));
    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    consumer
        .consume(
            smq::ConsumerQueue::new(queue.clone(), Some("audit".into())),
            counting_handler(audit_calls.clone(), 0),
        )
        .await
        .unwrap();
    consumer
        .consume(
            smq::ConsumerQueue::new(queue.clone(), Some("billing".into())),
            counting_handler(billing_calls.clone(), 0),
        )
        .await
        .unwrap();
    consumer.run().await.unwrap();

    let ids = Producer::new(store.clone())
        .produce(ProducibleMessage::new(queue.clone(), serde_json::json!("event")))
        .await
        .unwrap();
    assert_eq!(ids.len(), 2, "One record per consumer group");

    assert!(
        wait_for(Duration::from_secs(5), || async {
            audit_calls.load(Ordering::SeqCst) == 1 && billing_calls.load(Ordering::SeqCst) == 1
        })
        .await
    );

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeating_message_fires_repeat_plus_one_times() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "ticks", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let origins = Arc::new(Mutex::new(Vec::new()));
    let sink = origins.clone();
    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    consumer
        .consume(queue.clone(), move |message: Message| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message.scheduled_message_id.clone());
                Ok::<(), ConsumeError>(())
            }
        })
        .await
        .unwrap();
    consumer.run().await.unwrap();

    let ids = Producer::new(store.clone())
        .produce(
            ProducibleMessage::new(queue.clone(), serde_json::json!("tick"))
                .with_repeat(2, Duration::from_millis(300)),
        )
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || async { origins.lock().unwrap().len() == 3 }).await);
    tokio::time::sleep(Duration::from_millis(800)).await;
    let origins = origins.lock().unwrap().clone();
    assert_eq!(origins.len(), 3, "No firing after the repeats are used up");
    assert!(origins.iter().all(|origin| origin.as_deref() == Some(ids[0].as_str())));

    let counters = QueueManager::new(store.clone()).counters(&queue).await.unwrap();
    assert_eq!(counters.scheduled, 0);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_producer_validation() {
    let store = connect().await;
    let namespace = test_namespace();
    let fifo = create_queue(&store, &namespace, "plain", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let ranked = create_queue(&store, &namespace, "ranked", QueueType::Priority, DeliveryModel::PointToPoint).await;
    let topic = create_queue(&store, &namespace, "topic", QueueType::Fifo, DeliveryModel::PubSub).await;
    let producer = Producer::new(store.clone());

    let missing = smq::QueueParams::new(namespace.as_str(), "missing");
    assert!(matches!(
        producer.produce(ProducibleMessage::new(missing, serde_json::json!(1))).await,
        Err(smq::SmqError::QueueNotFound(_))
    ));
    assert!(matches!(
        producer
            .produce(ProducibleMessage::new(fifo, serde_json::json!(1)).with_priority(MessagePriority::High))
            .await,
        Err(smq::SmqError::PriorityNotSupported(_))
    ));
    assert!(matches!(
        producer.produce(ProducibleMessage::new(ranked, serde_json::json!(1))).await,
        Err(smq::SmqError::PriorityRequired(_))
    ));
    assert!(matches!(
        producer.produce(ProducibleMessage::new(topic.clone(), serde_json::json!(1))).await,
        Err(smq::SmqError::QueueHasNoConsumerGroups(_))
    ));
    assert!(matches!(
        producer
            .produce(ProducibleMessage::new(topic, serde_json::json!(1)).with_consumer_group("nobody"))
            .await,
        Err(smq::SmqError::ConsumerGroupNotFound { .. })
    ));

    cleanup_redis_keys(&store, &namespace).await;
}

fn smq_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
