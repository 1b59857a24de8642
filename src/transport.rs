//! The broker capabilities `carrot-lifeline` is built on top of.
//!
//! Connection recovery and consumer re-attachment only need a narrow slice of what an AMQP
//! client offers. That slice is captured by three traits - [`Connector`], [`BrokerConnection`]
//! and [`BrokerChannel`] - so that the state machines in this crate do not care whether they are
//! talking to [`lapin`] (see [`crate::amqp`]) or to an in-memory double in a test suite.
use amq_protocol_types::{DeliveryTag, FieldTable, ShortString};
use lapin::options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::{BasicProperties, ExchangeKind};
use std::sync::Arc;

/// Invoked by a [`BrokerChannel`] for every message pushed by the broker on a subscription.
///
/// `None` signals that the broker cancelled the subscription.
pub type DeliveryCallback = Arc<dyn Fn(Option<Delivery>) + Send + Sync>;

/// Invoked once when a [`BrokerConnection`] goes away.
///
/// It receives `Some(error)` if the connection was terminated abnormally and `None` if it was
/// closed gracefully.
pub type CloseListener = Box<dyn FnOnce(Option<anyhow::Error>) + Send>;

/// A message pushed by the broker on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The tag of the subscription the message was delivered on.
    pub consumer_tag: ShortString,
    /// The channel-scoped identifier of the delivery, used to ack/nack it.
    pub delivery_tag: DeliveryTag,
    /// Whether this message was redelivered.
    pub redelivered: bool,
    /// The exchange the message was published to. Empty for the default exchange.
    pub exchange: ShortString,
    /// The routing key the message was published with.
    pub routing_key: ShortString,
    /// Properties and headers of the message.
    pub properties: BasicProperties,
    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

/// Opens physical connections to a broker.
///
/// Implementers should perform a single attempt per call: retries and backoff are handled by
/// [`ConnectionManager`](crate::connection::ConnectionManager).
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, anyhow::Error>;
}

/// A physical connection to a broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Negotiate a new channel on top of this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, anyhow::Error>;

    /// Register the listener to be notified when the connection is closed.
    ///
    /// Only one listener is kept - registering a new one replaces the previous one.
    fn on_close(&self, listener: CloseListener);

    /// Gracefully close the connection.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a queue, returning its name.
    ///
    /// An empty `name` asks the broker to generate one.
    async fn assert_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, anyhow::Error>;

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    /// Start a subscription on `queue`, returning its consumer tag.
    ///
    /// If `consumer_tag` is `None` a new tag is assigned.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: Option<&str>,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        on_delivery: DeliveryCallback,
    ) -> Result<String, anyhow::Error>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn ack(&self, delivery_tag: DeliveryTag, all_up_to: bool) -> Result<(), anyhow::Error>;

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    /// Limit the number of unacknowledged deliveries on this channel.
    async fn prefetch(&self, count: u16) -> Result<(), anyhow::Error>;
}

/// assert they are object safe
type _CHECK = (
    Box<dyn Connector>,
    Box<dyn BrokerConnection>,
    Box<dyn BrokerChannel>,
);
