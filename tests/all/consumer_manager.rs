use crate::helpers::{
    argument, eventually, fast_reconnect_policy, Call, FakeConnector, Op, Succeed,
};
use carrot_lifeline::amqp::types::AMQPValue;
use carrot_lifeline::amqp::ExchangeKind;
use carrot_lifeline::connection::ConnectionManager;
use carrot_lifeline::consumers::{
    ClosureHandler, ConsumerManager, ConsumerManagerSettings, ConsumerOptions, Message,
    RetryTopology, DEFAULT_PREFETCH_COUNT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn retry_topology() -> RetryTopology {
    RetryTopology::new("retry.pre", "retry.post", "retry")
}

#[tokio::test]
async fn the_retry_topology_is_asserted_on_the_first_channel() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::new(ConnectionManager::new(
        connector.clone(),
        fast_reconnect_policy(),
    ));
    manager
        .setup_delayed_retry_topology(retry_topology())
        .await
        .unwrap();

    // Act
    manager.connection_manager().connect().await.unwrap();

    // Assert
    let calls = connector.last_channel().calls();
    assert!(matches!(&calls[0], Call::Prefetch(10)));
    assert!(matches!(
        &calls[1],
        Call::AssertExchange { name, kind: ExchangeKind::Topic, options }
            if name == "retry.pre" && options.durable && !options.auto_delete
    ));
    assert!(matches!(
        &calls[2],
        Call::AssertExchange { name, kind: ExchangeKind::Direct, options }
            if name == "retry.post" && options.durable && !options.auto_delete
    ));
    match &calls[3] {
        Call::AssertQueue {
            name,
            options,
            arguments,
        } => {
            assert_eq!(name, "retry");
            assert!(options.durable);
            assert!(!options.auto_delete);
            assert_eq!(
                argument(arguments, "x-dead-letter-exchange"),
                Some(&AMQPValue::LongString("retry.post".into()))
            );
        }
        other => panic!("Unexpected call: {:?}", other),
    }
    assert!(matches!(
        &calls[4],
        Call::BindQueue { queue, exchange, pattern }
            if queue == "retry" && exchange == "retry.pre" && pattern == "*"
    ));
}

#[tokio::test]
async fn consumers_join_the_retry_topology_before_subscribing() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    manager
        .setup_delayed_retry_topology(retry_topology())
        .await
        .unwrap();

    // Act
    let consumer = manager
        .consume(Succeed, ConsumerOptions::for_queue("orders"))
        .await
        .unwrap();

    // Assert
    assert!(consumer.is_consuming());
    assert_eq!(consumer.retry_topology().as_deref(), Some(&retry_topology()));
    let calls = connector.last_channel().calls();
    let tail: Vec<_> = calls.iter().rev().take(3).rev().collect();
    assert!(matches!(tail[0], Call::AssertQueue { name, .. } if name == "orders"));
    assert!(matches!(
        tail[1],
        Call::BindQueue { queue, exchange, pattern }
            if queue == "orders" && exchange == "retry.post" && pattern == "orders"
    ));
    assert!(matches!(tail[2], Call::Consume { queue, .. } if queue == "orders"));
}

#[tokio::test]
async fn existing_consumers_join_a_retry_topology_set_up_later() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    let consumer = manager
        .consume(Succeed, ConsumerOptions::for_queue("orders"))
        .await
        .unwrap();

    // Act
    manager
        .setup_delayed_retry_topology(retry_topology())
        .await
        .unwrap();

    // Assert
    assert!(consumer.retry_topology().is_some());
    let calls = connector.last_channel().calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        Call::BindQueue { queue, exchange, pattern }
            if queue == "retry" && exchange == "retry.pre" && pattern == "*"
    )));
    assert!(matches!(
        calls.last(),
        Some(Call::BindQueue { queue, exchange, pattern })
            if queue == "orders" && exchange == "retry.post" && pattern == "orders"
    ));
}

#[tokio::test]
async fn prefetch_is_applied_once_per_channel() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    for queue in ["orders", "invoices", "refunds"] {
        manager
            .consume(Succeed, ConsumerOptions::for_queue(queue))
            .await
            .unwrap();
    }
    assert_eq!(connector.last_channel().prefetches(), vec![DEFAULT_PREFETCH_COUNT]);

    // Act
    connector.last_connection().break_with_error("network partition");

    // Assert
    eventually(|| connector.connections().len() == 2 && connector.last_channel().consumed().len() == 3)
        .await;
    assert_eq!(connector.last_channel().prefetches(), vec![DEFAULT_PREFETCH_COUNT]);
}

#[tokio::test]
async fn consumers_are_reattached_in_registration_order_after_a_reconnection() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    manager
        .setup_delayed_retry_topology(retry_topology())
        .await
        .unwrap();
    let mut consumers = Vec::new();
    for queue in ["orders", "invoices", "refunds"] {
        consumers.push(
            manager
                .consume(Succeed, ConsumerOptions::for_queue(queue))
                .await
                .unwrap(),
        );
    }

    // Act
    connector.fail_next(2);
    connector.last_connection().break_with_error("broker restarted");

    // Assert
    eventually(|| consumers.iter().all(|c| c.is_consuming()) && connector.connections().len() == 2)
        .await;
    let channel = connector.last_channel();
    let resubscribed: Vec<_> = channel.consumed();
    assert_eq!(
        resubscribed,
        consumers
            .iter()
            .map(|c| (c.queue().unwrap(), c.consumer_tag()))
            .collect::<Vec<_>>()
    );
    // The retry topology is re-asserted before consumers re-subscribe.
    let calls = channel.calls();
    let topology = calls
        .iter()
        .position(|call| matches!(call, Call::AssertQueue { name, .. } if name == "retry"))
        .unwrap();
    let first_consume = calls
        .iter()
        .position(|call| matches!(call, Call::Consume { .. }))
        .unwrap();
    assert!(topology < first_consume);
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test]
async fn consumers_are_reattached_even_if_the_retry_topology_cannot_be_asserted() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    manager
        .setup_delayed_retry_topology(retry_topology())
        .await
        .unwrap();
    let consumer = manager
        .consume(Succeed, ConsumerOptions::for_queue("orders"))
        .await
        .unwrap();

    // Act
    connector.fail_on_new_channels(Op::AssertExchange);
    connector.last_connection().break_with_error("broker restarted");

    // Assert
    eventually(|| connector.connections().len() == 2 && consumer.is_consuming()).await;
    let channel = connector.last_channel();
    assert_eq!(channel.prefetches(), vec![DEFAULT_PREFETCH_COUNT]);
    assert!(channel
        .calls()
        .iter()
        .all(|call| !matches!(call, Call::AssertExchange { .. })));
    assert_eq!(
        channel.consumed(),
        vec![("orders".to_string(), consumer.consumer_tag())]
    );
}

#[tokio::test]
async fn consumers_are_reattached_even_if_prefetch_fails() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    let consumer = manager
        .consume(Succeed, ConsumerOptions::for_queue("orders"))
        .await
        .unwrap();

    // Act
    connector.fail_on_new_channels(Op::Prefetch);
    connector.last_connection().break_with_error("broker restarted");

    // Assert
    eventually(|| connector.connections().len() == 2 && consumer.is_consuming()).await;
    assert_eq!(connector.last_channel().consumed().len(), 1);
}

#[tokio::test]
async fn consumers_registered_after_a_disconnect_wait_for_the_next_connection() {
    // Arrange
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    manager.connection_manager().disconnect().await.unwrap();

    // Act
    let consumer = manager
        .consume(Succeed, ConsumerOptions::for_queue("orders"))
        .await
        .unwrap();

    // Assert
    assert!(!consumer.is_consuming());
    assert!(connector.last_channel().consumed().is_empty());

    // A new connection picks it up.
    manager.connection_manager().connect().await.unwrap();
    assert!(consumer.is_consuming());
    assert_eq!(connector.connections().len(), 2);
    assert_eq!(connector.last_channel().consumed().len(), 1);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_messages() {
    // Arrange
    let gate = Arc::new(Semaphore::new(0));
    let handler_gate = Arc::clone(&gate);
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    let consumer = manager
        .consume(
            ClosureHandler(move |_: Message| {
                let gate = Arc::clone(&handler_gate);
                async move {
                    gate.acquire().await?.forget();
                    Ok::<(), anyhow::Error>(())
                }
            }),
            ConsumerOptions::for_queue("orders"),
        )
        .await
        .unwrap();
    connector.last_channel().deliver("ctag-1", 1, "slow");

    // Act
    let shutdown = tokio::spawn({
        let manager = manager.clone();
        async move { manager.shutdown().await }
    });
    eventually(|| consumer.is_stopped()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!connector.last_connection().is_closed());
    gate.add_permits(1);
    shutdown.await.unwrap().unwrap();

    // Assert
    assert_eq!(consumer.ongoing_consumptions(), 0);
    assert_eq!(connector.last_channel().acks(), vec![1]);
    assert!(connector.last_connection().is_closed());
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn run_until_shutdown_waits_for_the_signal() {
    let connector = FakeConnector::new();
    let manager = ConsumerManager::connect(connector.clone(), fast_reconnect_policy())
        .await
        .unwrap();
    let consumer = manager
        .consume(Succeed, ConsumerOptions::for_queue("orders"))
        .await
        .unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let running = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .run_until_shutdown(async move {
                    let _ = rx.await;
                })
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(consumer.is_consuming());
    tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    assert!(consumer.is_stopped());
    assert!(!manager.connection_manager().is_connected());
}

#[test]
fn settings_can_be_deserialized() {
    let settings: ConsumerManagerSettings = serde_json::from_value(serde_json::json!({
        "rabbitmq": {
            "uri": "localhost",
            "vhost": "/",
            "username": "guest",
            "password": "guest",
            "connection_timeout_seconds": 10,
            "port": "5672",
            "tls": null,
            "heartbeat_seconds": 30
        },
        "reconnect": { "max_retries": 3 },
        "retry_topology": {
            "pre_exchange": "retry.pre",
            "post_exchange": "retry.post",
            "queue": "retry"
        }
    }))
    .unwrap();

    assert_eq!(settings.prefetch_count, DEFAULT_PREFETCH_COUNT);
    assert_eq!(settings.reconnect.max_retries, Some(3));
    assert_eq!(settings.retry_topology, Some(retry_topology()));
}
