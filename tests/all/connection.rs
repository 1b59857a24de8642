use crate::helpers::{eventually, fast_reconnect_policy, FakeConnector, Succeed};
use carrot_lifeline::connection::{ConnectionError, ConnectionEvent, ConnectionManager};
use carrot_lifeline::consumers::{ConsumerError, ConsumerOptions};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn record_events(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    manager.on_event(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

/// A compact rendering of the recorded events, e.g. `["connected", "channel"]`.
fn names(events: &Mutex<Vec<ConnectionEvent>>) -> Vec<&'static str> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Channel(_) => "channel",
            ConnectionEvent::Consumer(_) => "consumer",
            ConnectionEvent::Retry { .. } => "retry",
            ConnectionEvent::Error(_) => "error",
            ConnectionEvent::Disconnected { error: None } => "closed",
            ConnectionEvent::Disconnected { error: Some(_) } => "lost",
        })
        .collect()
}

#[tokio::test]
async fn connecting_emits_connected_then_channel() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConnectionManager::new(connector.clone(), fast_reconnect_policy());
    let events = record_events(&manager);

    // Act
    manager.connect().await.unwrap();

    // Assert
    assert!(manager.is_connected());
    assert!(manager.channel().is_some());
    assert_eq!(names(&events), vec!["connected", "channel"]);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn failed_attempts_are_retried_with_backoff() {
    // Arrange
    let connector = FakeConnector::new();
    connector.fail_next(3);
    let manager = ConnectionManager::new(connector.clone(), fast_reconnect_policy());
    let events = record_events(&manager);

    // Act
    manager.connect().await.unwrap();

    // Assert
    assert_eq!(connector.attempts(), 4);
    assert_eq!(
        names(&events),
        vec!["retry", "retry", "retry", "connected", "channel"]
    );
    let retries: Vec<(u32, Duration)> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ConnectionEvent::Retry { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        retries,
        vec![
            (1, Duration::from_millis(1)),
            (2, Duration::from_millis(2)),
            (3, Duration::from_millis(4))
        ]
    );
}

#[tokio::test]
async fn connecting_fails_once_the_retry_budget_is_exhausted() {
    // Arrange
    let connector = FakeConnector::new();
    connector.fail_next(usize::MAX);
    let manager = ConnectionManager::new(
        connector.clone(),
        fast_reconnect_policy().with_max_retries(2),
    );
    let events = record_events(&manager);

    // Act
    let outcome = manager.connect().await;

    // Assert
    assert!(matches!(
        outcome,
        Err(ConnectionError::RetriesExhausted { attempts: 2, .. })
    ));
    assert_eq!(connector.attempts(), 3);
    assert_eq!(names(&events), vec!["retry", "retry", "error"]);
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn consumers_are_reattached_after_an_abnormal_close() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConnectionManager::new(connector.clone(), fast_reconnect_policy());
    manager.connect().await.unwrap();
    let first = manager
        .consume(ConsumerOptions::for_queue("orders"), Succeed)
        .await
        .unwrap();
    let second = manager
        .consume(ConsumerOptions::for_queue("invoices"), Succeed)
        .await
        .unwrap();
    let events = record_events(&manager);
    let first_connection = connector.last_connection();

    // Act
    first_connection.break_with_error("connection reset by peer");

    // Assert
    eventually(|| connector.connections().len() == 2 && first.is_consuming() && second.is_consuming())
        .await;
    let channel = connector.last_channel();
    assert_eq!(
        channel.consumed(),
        vec![
            ("orders".to_owned(), first.consumer_tag()),
            ("invoices".to_owned(), second.consumer_tag()),
        ]
    );
    assert_eq!(names(&events), vec!["lost", "connected", "channel"]);
}

#[tokio::test]
async fn consumers_are_detached_while_reconnecting() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConnectionManager::new(
        connector.clone(),
        fast_reconnect_policy().with_max_retries(0),
    );
    manager.connect().await.unwrap();
    let consumer = manager
        .consume(ConsumerOptions::for_queue("orders"), Succeed)
        .await
        .unwrap();
    let events = record_events(&manager);

    // Act
    connector.fail_next(usize::MAX);
    connector.last_connection().break_with_error("gone");

    // Assert
    eventually(|| names(&events).contains(&"error")).await;
    assert!(!manager.is_connected());
    assert!(!consumer.is_consuming());
    assert!(matches!(
        consumer.resume().await,
        Err(ConsumerError::NoChannel)
    ));
}

#[tokio::test]
async fn a_graceful_close_does_not_trigger_a_reconnection() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConnectionManager::new(connector.clone(), fast_reconnect_policy());
    manager.connect().await.unwrap();
    let consumer = manager
        .consume(ConsumerOptions::for_queue("orders"), Succeed)
        .await
        .unwrap();
    let events = record_events(&manager);

    // Act
    manager.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Assert
    assert!(connector.last_connection().is_closed());
    assert_eq!(connector.attempts(), 1);
    assert!(!manager.is_connected());
    assert_eq!(names(&events), vec!["closed"]);
    // Disconnecting does not stop consumers.
    assert!(consumer.is_consuming());
}

#[tokio::test]
async fn consumers_registered_before_connecting_are_attached_on_connect() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConnectionManager::new(connector.clone(), fast_reconnect_policy());
    let events = record_events(&manager);
    let consumer = manager
        .consume(ConsumerOptions::for_queue("orders"), Succeed)
        .await
        .unwrap();
    assert!(!consumer.is_consuming());

    // Act
    manager.connect().await.unwrap();

    // Assert
    assert!(consumer.is_consuming());
    assert_eq!(names(&events), vec!["consumer", "connected", "channel"]);
    assert_eq!(manager.consumers().await.len(), 1);
}

#[tokio::test]
async fn stop_all_consumers_only_stops_consuming_consumers() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConnectionManager::new(connector.clone(), fast_reconnect_policy());
    manager.connect().await.unwrap();
    let running = manager
        .consume(ConsumerOptions::for_queue("orders"), Succeed)
        .await
        .unwrap();
    let stopped = manager
        .consume(ConsumerOptions::for_queue("invoices"), Succeed)
        .await
        .unwrap();
    stopped.stop().await.unwrap();

    // Act
    manager.stop_all_consumers().await.unwrap();

    // Assert
    assert!(running.is_stopped());
    assert!(stopped.is_stopped());
    let cancellations = connector
        .last_channel()
        .calls()
        .iter()
        .filter(|call| matches!(call, crate::helpers::Call::Cancel { .. }))
        .count();
    assert_eq!(cancellations, 2);
}

#[tokio::test]
async fn the_loss_of_a_replaced_connection_is_ignored() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConnectionManager::new(connector.clone(), fast_reconnect_policy());
    manager.connect().await.unwrap();
    let replaced = connector.last_connection();
    manager.connect().await.unwrap();

    // Act
    replaced.break_with_error("late error");
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Assert
    assert!(replaced.is_closed());
    assert_eq!(connector.attempts(), 2);
    assert!(manager.is_connected());
}
