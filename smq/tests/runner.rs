mod fixtures;
use fixtures::*;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use smq::{
    Consumer, DeliveryModel, Message, Producer, ProducibleMessage, QueueStateManager, QueueType,
    Runnable, SmqError,
    consumer::{ConsumeError, MessageConsumer},
    queue::QueueStateReason,
};

fn counter(calls: Arc<AtomicUsize>) -> impl MessageConsumer {
    move |_message: Message| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ConsumeError>(())
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_and_remove_handlers() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "jobs", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    consumer.consume(queue.clone(), counter(calls.clone())).await.unwrap();

    let duplicate = consumer.consume(queue.clone(), counter(calls.clone())).await;
    assert!(matches!(duplicate, Err(SmqError::MessageHandlerAlreadyExists(_))));

    consumer.run().await.unwrap();
    assert_eq!(consumer.runner().running_queues().await, vec![smq::ConsumerQueue::from(queue.clone())]);

    consumer.cancel(queue.clone()).await.unwrap();
    assert!(consumer.get_queues().await.is_empty());
    assert!(consumer.runner().running_queues().await.is_empty());

    // Removing twice is a no-op
    consumer.cancel(queue.clone()).await.unwrap();

    // Added while running: starts right away
    consumer.consume(queue.clone(), counter(calls.clone())).await.unwrap();
    assert_eq!(consumer.runner().running_queues().await.len(), 1);

    Producer::new(store.clone())
        .produce(ProducibleMessage::new(queue.clone(), serde_json::json!(1)))
        .await
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || async { calls.load(Ordering::SeqCst) == 1 }).await);

    consumer.shutdown().await.unwrap();
    assert!(consumer.runner().running_queues().await.is_empty());
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_on_missing_queue_does_not_run() {
    let store = connect().await;
    let namespace = test_namespace();
    let missing = smq::QueueParams::new(namespace.as_str(), "nowhere");

    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    consumer
        .consume(missing.clone(), counter(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    consumer.run().await.unwrap();

    assert!(consumer.runner().running_queues().await.is_empty());
    assert_eq!(consumer.get_queues().await, vec![smq::ConsumerQueue::from(missing)]);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_paused_queue_stops_and_resumes_its_handler() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "pausable", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let states = QueueStateManager::new(store.clone());

    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    consumer.consume(queue.clone(), counter(calls.clone())).await.unwrap();
    consumer.run().await.unwrap();
    assert_eq!(consumer.runner().running_queues().await.len(), 1);

    states.pause(&queue, QueueStateReason::Manual).await.unwrap();
    let runner = consumer.runner();
    assert!(
        wait_for(Duration::from_secs(5), || async {
            runner.running_queues().await.is_empty()
        })
        .await,
        "Pausing the queue stops its handler"
    );
    assert!(runner.is_queue_paused(&queue).await);
    assert!(!runner.is_queue_active(&queue).await);

    Producer::new(store.clone())
        .produce(ProducibleMessage::new(queue.clone(), serde_json::json!("held")))
        .await
        .unwrap();

    // Reconciliation must not bring a paused queue back
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(runner.running_queues().await.is_empty());

    states.activate(&queue, QueueStateReason::Manual).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || async { calls.load(Ordering::SeqCst) == 1 }).await,
        "Resuming the queue restarts its handler"
    );
    assert!(runner.is_queue_active(&queue).await);
    assert_eq!(runner.running_queues().await.len(), 1);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_restarts_stopped_handler() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "late", QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let states = QueueStateManager::new(store.clone());
    states.stop(&queue, QueueStateReason::Maintenance).await.unwrap();

    let consumer = Consumer::new(store.clone(), fast_options()).unwrap();
    consumer
        .consume(queue.clone(), counter(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    consumer.run().await.unwrap();
    assert!(consumer.runner().running_queues().await.is_empty());
    assert!(consumer.runner().is_queue_stopped(&queue).await);

    // Activated behind the consumer's back: an explicit pass converges
    let mut conn = store.conn();
    redis::cmd("HSET")
        .arg(smq::keys::QueueKeys::new(&queue).properties())
        .arg("state")
        .arg("ACTIVE")
        .query_async::<()>(&mut conn)
        .await
        .unwrap();
    consumer.runner().reconcile().await;
    assert_eq!(consumer.runner().running_queues().await.len(), 1);
    assert!(consumer.runner().is_queue_active(&queue).await);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_stops_handler_of_paused_queue() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "quiet", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    // Only explicit passes reconcile
    let mut options = fast_options();
    options.runner.reconcile_interval = Duration::from_secs(60);
    let consumer = Consumer::new(store.clone(), options).unwrap();
    consumer
        .consume(queue.clone(), counter(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    consumer.run().await.unwrap();
    assert_eq!(consumer.runner().running_queues().await.len(), 1);

    // Paused without an event reaching the consumer
    let mut conn = store.conn();
    redis::cmd("HSET")
        .arg(smq::keys::QueueKeys::new(&queue).properties())
        .arg("state")
        .arg("PAUSED")
        .query_async::<()>(&mut conn)
        .await
        .unwrap();
    consumer.runner().reconcile().await;

    assert!(consumer.runner().running_queues().await.is_empty());
    assert!(consumer.runner().is_queue_paused(&queue).await);

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_changes_are_seen_after_subscription_drops() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "resubscribed", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let mut options = fast_options();
    options.runner.reconcile_interval = Duration::from_secs(60);
    let consumer = Consumer::new(store.clone(), options).unwrap();
    consumer
        .consume(queue.clone(), counter(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    consumer.run().await.unwrap();
    assert_eq!(consumer.runner().running_queues().await.len(), 1);

    let mut conn = store.conn();
    redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("pubsub")
        .query_async::<i64>(&mut conn)
        .await
        .unwrap();

    QueueStateManager::new(store.clone())
        .pause(&queue, QueueStateReason::Manual)
        .await
        .unwrap();
    let runner = consumer.runner();
    assert!(
        wait_for(Duration::from_secs(5), || async {
            runner.running_queues().await.is_empty()
        })
        .await,
        "The pause is applied once the subscription is back"
    );

    consumer.shutdown().await.unwrap();
    cleanup_redis_keys(&store, &namespace).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_interrupts_indefinite_blocking_dequeue() {
    let store = connect().await;
    let namespace = test_namespace();
    let queue = create_queue(&store, &namespace, "idle", QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let mut options = fast_options();
    options.dequeuer.blocking_timeout = Duration::ZERO;
    let consumer = Consumer::new(store.clone(), options).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    consumer.consume(queue.clone(), counter(calls.clone())).await.unwrap();
    consumer.run().await.unwrap();

    // Let the handler park on the empty queue
    tokio::time::sleep(Duration::from_millis(300)).await;
    tokio::time::timeout(Duration::from_secs(5), consumer.shutdown())
        .await
        .expect("Shutdown must not wait on a blocked dequeue")
        .unwrap();

    Producer::new(store.clone())
        .produce(ProducibleMessage::new(queue.clone(), serde_json::json!("after")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let manager = smq::QueueManager::new(store.clone());
    assert_eq!(
        manager.count_pending(&smq::ConsumerQueue::from(queue.clone())).await.unwrap(),
        1,
        "No dequeue outlives the handler"
    );
    assert!(manager.get_processing_queues(&queue).await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    cleanup_redis_keys(&store, &namespace).await;
}
