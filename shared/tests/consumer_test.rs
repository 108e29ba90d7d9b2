// ============================================================================
// Consumer Loop Integration Tests
// ============================================================================
//
// Ack discipline, backpressure, requeue on handler failure, resubscribe
// after a broken connection and both execution modes.
//
// ============================================================================

mod test_utils;

use courier_config::ConnectStrategy;
use courier_shared::{
    Aggregator, ChannelSettings, ConsumerError, ConsumerLoop, MemoryBroker, NotifyHandler,
    ResilientChannel,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_utils::{
    FlakyHandler, GatedHandler, QUEUE, RecordingHandler, batch, body, consumer_config, eventually,
    settings,
};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_next_delivery_waits_for_ack() {
    let broker = MemoryBroker::new();
    for i in 0..3 {
        broker.inject(QUEUE, format!("m{i}"));
    }

    let handler = Arc::new(GatedHandler::new());
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3));
    let consumer = ConsumerLoop::new(channel, handler.clone(), &consumer_config());
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || handler.started() == 1).await);

    // the handler is suspended: nothing else may be handed out meanwhile
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.started(), 1);
    assert_eq!(broker.unacked(QUEUE), 1);
    assert_eq!(broker.ready(QUEUE), 2);

    handler.release(1);
    assert!(eventually(WAIT, || handler.started() == 2).await);
    assert_eq!(broker.acked(QUEUE), 1);

    handler.release(2);
    assert!(eventually(WAIT, || broker.acked(QUEUE) == 3).await);
    assert_eq!(broker.peak_unacked(QUEUE), 1);

    stop.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_delivery_is_requeued_and_retried() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, "retry me");

    let handler = Arc::new(FlakyHandler::new(2));
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3));
    let consumer = ConsumerLoop::new(channel, handler.clone(), &consumer_config());
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || broker.acked(QUEUE) == 1).await);
    assert_eq!(handler.calls(), 3);
    assert_eq!(broker.ready(QUEUE), 0);
    assert_eq!(broker.unacked(QUEUE), 0);

    stop.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_delivery_is_never_acked() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, "poison");

    let handler = Arc::new(FlakyHandler::new(usize::MAX));
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3));
    let consumer = ConsumerLoop::new(channel, handler.clone(), &consumer_config());
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || handler.calls() >= 3).await);
    stop.stop();
    running.await.unwrap().unwrap();

    assert_eq!(broker.acked(QUEUE), 0);
    assert_eq!(broker.ready_bodies(QUEUE), vec![b"poison".to_vec()]);
}

#[tokio::test]
async fn test_stop_lets_current_delivery_finish() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, "a");
    broker.inject(QUEUE, "b");

    let handler = Arc::new(GatedHandler::new());
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3));
    let consumer = ConsumerLoop::new(channel, handler.clone(), &consumer_config());
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || handler.started() == 1).await);
    stop.stop();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!running.is_finished());

    handler.release(1);
    running.await.unwrap().unwrap();

    assert_eq!(handler.finished(), 1);
    assert_eq!(broker.acked(QUEUE), 1);
    assert_eq!(broker.ready_bodies(QUEUE), vec![b"b".to_vec()]);
}

#[tokio::test]
async fn test_idle_consumer_stops_promptly() {
    let broker = MemoryBroker::new();
    let handler = Arc::new(RecordingHandler::default());
    let channel = ResilientChannel::new(broker, settings(ConnectStrategy::Lazy, 3));
    let consumer = ConsumerLoop::new(channel, handler, &consumer_config());
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.stop();

    tokio::time::timeout(WAIT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_resubscribes_after_broken_connection() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, "one");

    let handler = Arc::new(RecordingHandler::default());
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3));
    let consumer = ConsumerLoop::new(channel, handler.clone(), &consumer_config());
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || broker.acked(QUEUE) == 1).await);

    broker.break_connections();
    assert!(eventually(WAIT, || broker.connect_attempts() == 2).await);

    broker.inject(QUEUE, "two");
    assert!(eventually(WAIT, || broker.acked(QUEUE) == 2).await);
    assert_eq!(
        *handler.seen.lock().await,
        vec![b"one".to_vec(), b"two".to_vec()]
    );

    stop.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_loop_ends_when_broker_stays_unreachable() {
    let broker = MemoryBroker::new();
    let handler = Arc::new(RecordingHandler::default());
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 2));
    let consumer = ConsumerLoop::new(channel, handler, &consumer_config());
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || broker.connect_attempts() == 1).await);
    broker.fail_next_connects(u32::MAX);
    broker.break_connections();

    let result = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
    match result {
        Err(ConsumerError::Channel(e)) => assert!(e.is_connection_exhausted()),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn test_stop_interrupts_initial_connect_retries() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(u32::MAX);

    let slow_retries = ChannelSettings {
        retry_delay: Duration::from_millis(400),
        ..settings(ConnectStrategy::Lazy, 5)
    };
    let channel = ResilientChannel::new(broker.clone(), slow_retries);
    let consumer = ConsumerLoop::new(
        channel,
        Arc::new(RecordingHandler::default()),
        &consumer_config(),
    );
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || broker.connect_attempts() == 1).await);
    let started = Instant::now();
    stop.stop();

    tokio::time::timeout(Duration::from_millis(200), running)
        .await
        .expect("stop should not wait for the remaining connect attempts")
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_stop_interrupts_reconnect_after_broken_connection() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, "one");

    let slow_retries = ChannelSettings {
        retry_delay: Duration::from_millis(400),
        ..settings(ConnectStrategy::Eager, 5)
    };
    let handler = Arc::new(RecordingHandler::default());
    let channel = ResilientChannel::new(broker.clone(), slow_retries);
    let consumer = ConsumerLoop::new(channel, handler, &consumer_config());
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    assert!(eventually(WAIT, || broker.acked(QUEUE) == 1).await);
    broker.fail_next_connects(u32::MAX);
    broker.break_connections();
    assert!(eventually(WAIT, || broker.connect_attempts() == 2).await);

    stop.stop();
    let result = tokio::time::timeout(Duration::from_millis(200), running)
        .await
        .expect("stop should not wait for the remaining connect attempts")
        .unwrap();
    assert!(result.is_ok(), "unexpected result: {result:?}");
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn test_dedicated_thread_feeds_aggregator() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, body(&batch(1, 10, 100, &[5, 6])));
    broker.inject(QUEUE, body(&batch(1, 11, 101, &[5])));

    let aggregator = Aggregator::new();
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3));
    let consumer = ConsumerLoop::new(
        channel,
        NotifyHandler::new(aggregator.clone()),
        &consumer_config(),
    );
    let thread = consumer.spawn_dedicated("notify-listener-test").unwrap();

    assert!(eventually(WAIT, || broker.acked(QUEUE) == 2).await);
    thread.stop();
    tokio::task::spawn_blocking(move || thread.join())
        .await
        .unwrap()
        .unwrap();

    let popped = aggregator.pop_for(5).await.unwrap();
    assert_eq!(popped.message_count(), 2);
    assert_eq!(aggregator.pending_recipients().await, vec![6]);
}

#[tokio::test]
async fn test_malformed_payload_stays_on_queue() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, "not json");

    let aggregator = Aggregator::new();
    let channel = ResilientChannel::new(broker.clone(), settings(ConnectStrategy::Eager, 3));
    let consumer = ConsumerLoop::new(
        channel,
        NotifyHandler::new(aggregator.clone()),
        &consumer_config(),
    );
    let stop = consumer.stop_handle();
    let running = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.stop();
    running.await.unwrap().unwrap();

    assert_eq!(broker.acked(QUEUE), 0);
    assert_eq!(broker.ready(QUEUE), 1);
    assert!(aggregator.snapshot().await.is_empty());
}
