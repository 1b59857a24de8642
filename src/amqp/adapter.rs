//! [`lapin`]-backed implementations of the broker capabilities defined in [`crate::transport`].
use crate::transport::{BrokerChannel, BrokerConnection, CloseListener, Delivery, DeliveryCallback};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{DeliveryTag, FieldTable, ShortString};
use lapin::{BasicProperties, ExchangeKind};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Reply code sent to the broker when we close a connection on purpose.
const REPLY_SUCCESS: u16 = 200;

/// A [`lapin::Connection`] exposed as a [`BrokerConnection`].
pub struct LapinConnection {
    connection: lapin::Connection,
    close_listener: Arc<Mutex<Option<CloseListener>>>,
}

impl LapinConnection {
    /// Wrap an established connection.
    ///
    /// Connection errors reported by `lapin` are logged and forwarded to the close listener,
    /// if one has been registered.
    pub fn new(connection: lapin::Connection) -> Self {
        let close_listener: Arc<Mutex<Option<CloseListener>>> = Arc::default();
        let listener = Arc::clone(&close_listener);
        connection.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            if let Some(listener) = take_listener(&listener) {
                listener(Some(e.into()));
            }
        });
        Self {
            connection,
            close_listener,
        }
    }

    /// Access the inner `lapin::Connection`.
    pub fn raw(&self) -> &lapin::Connection {
        &self.connection
    }
}

fn take_listener(slot: &Mutex<Option<CloseListener>>) -> Option<CloseListener> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

#[async_trait::async_trait]
impl BrokerConnection for LapinConnection {
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, anyhow::Error> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    fn on_close(&self, listener: CloseListener) {
        *self
            .close_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        let result = self.connection.close(REPLY_SUCCESS, "OK").await;
        if let Some(listener) = take_listener(&self.close_listener) {
            listener(None);
        }
        Ok(result?)
    }
}

/// A [`lapin::Channel`] exposed as a [`BrokerChannel`].
#[derive(Clone)]
pub struct LapinChannel(lapin::Channel);

impl LapinChannel {
    pub fn new(channel: lapin::Channel) -> Self {
        Self(channel)
    }

    /// Access the inner `lapin::Channel`.
    pub fn raw(&self) -> &lapin::Channel {
        &self.0
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, anyhow::Error> {
        let queue = self.0.queue_declare(name, options, arguments).await?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.0
            .exchange_declare(name, kind, options, arguments)
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.0
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: Option<&str>,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        on_delivery: DeliveryCallback,
    ) -> Result<String, anyhow::Error> {
        let consumer_tag = consumer_tag
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut consumer = self
            .0
            .basic_consume(queue, &consumer_tag, options, arguments)
            .await?;

        let tag = ShortString::from(consumer_tag.clone());
        // Deliveries are forwarded from a dedicated task so the broker can keep pushing
        // messages while earlier ones are still being processed.
        tokio::spawn(async move {
            while let Some(event) = consumer.next().await {
                match event {
                    Ok(delivery) => on_delivery(Some(Delivery {
                        consumer_tag: tag.clone(),
                        delivery_tag: delivery.delivery_tag,
                        redelivered: delivery.redelivered,
                        exchange: delivery.exchange,
                        routing_key: delivery.routing_key,
                        properties: delivery.properties,
                        data: delivery.data,
                    })),
                    Err(e) => {
                        error!(consumer_tag = %tag.as_str(), "Consumer error: {}", e);
                        break;
                    }
                }
            }
            debug!(consumer_tag = %tag.as_str(), "Delivery stream closed");
            on_delivery(None);
        });

        Ok(consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: DeliveryTag, all_up_to: bool) -> Result<(), anyhow::Error> {
        self.0
            .basic_ack(
                delivery_tag,
                BasicAckOptions {
                    multiple: all_up_to,
                },
            )
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        self.0
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: all_up_to,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        self.0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), anyhow::Error> {
        self.0
            .basic_qos(count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }
}
