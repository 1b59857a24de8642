use crate::amqp::convenience::BasicPropertiesExt;
use crate::amqp::types::{DeliveryTag, FieldTable, ShortString};
use crate::amqp::BasicProperties;
use crate::transport::Delivery;
use std::borrow::Cow;
use std::sync::Arc;

/// A message received from RabbitMq, together with the name of the queue it was consumed from.
///
/// `Message` is a read-only view: cloning it is cheap and never copies the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    delivery: Arc<Delivery>,
    queue: Arc<str>,
}

impl Message {
    pub fn new(delivery: Delivery, queue: &str) -> Self {
        Self {
            delivery: Arc::new(delivery),
            queue: Arc::from(queue),
        }
    }

    /// The payload of the message in binary format.
    pub fn content(&self) -> &[u8] {
        &self.delivery.data
    }

    /// The payload decoded as UTF-8, replacing invalid sequences.
    pub fn content_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.delivery.data)
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    /// The headers of the message, if any were set by the publisher.
    pub fn headers(&self) -> Option<&FieldTable> {
        self.delivery.properties.headers().as_ref()
    }

    /// Lookup a header string value.
    pub fn header_str(&self, key: &str) -> Option<Cow<'_, str>> {
        self.delivery
            .properties
            .get_header_str(&ShortString::from(key))
    }

    /// The exchange the message was published to. Empty for the default exchange.
    pub fn exchange(&self) -> &str {
        self.delivery.exchange.as_str()
    }

    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn consumer_tag(&self) -> &str {
        self.delivery.consumer_tag.as_str()
    }

    /// The raw delivery metadata.
    pub fn fields(&self) -> &Delivery {
        &self.delivery
    }

    /// The queue the message was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}
