use crate::amqp::convenience::expiration;
use crate::consumers::{Consumer, ConsumerError, ConsumerEvent, Message, RetryTopology};
use crate::transport::BrokerChannel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Decides what happens to a message once its [`MessageHandler`](crate::consumers::MessageHandler)
/// has returned.
///
/// Implementers are expected to settle the message - by calling [`ResultContext::ack`],
/// [`ResultContext::reject`] or [`ResultContext::retry`] - exactly once.
/// Messages left unsettled are rejected and requeued.
#[async_trait::async_trait]
pub trait ResultHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        context: &ResultContext,
        outcome: &Result<(), anyhow::Error>,
    ) -> Result<(), anyhow::Error>;
}

/// Ack messages that were processed successfully, reject (and requeue) the others.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResultHandler;

#[async_trait::async_trait]
impl ResultHandler for DefaultResultHandler {
    async fn handle(
        &self,
        context: &ResultContext,
        outcome: &Result<(), anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        match outcome {
            Ok(()) => context.ack(false).await?,
            Err(_) => context.reject(true, false).await?,
        }
        Ok(())
    }
}

/// Everything a [`ResultHandler`] needs to settle one delivery.
pub struct ResultContext {
    message: Message,
    channel: Arc<dyn BrokerChannel>,
    consumer: Consumer,
    retry_topology: Option<Arc<RetryTopology>>,
    settled: AtomicBool,
}

impl ResultContext {
    pub(crate) fn new(
        message: Message,
        channel: Arc<dyn BrokerChannel>,
        consumer: Consumer,
        retry_topology: Option<Arc<RetryTopology>>,
    ) -> Self {
        Self {
            message,
            channel,
            consumer,
            retry_topology,
            settled: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The channel the message was delivered on.
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    pub fn retry_topology(&self) -> Option<&RetryTopology> {
        self.retry_topology.as_deref()
    }

    /// Whether the message has already been acked or rejected.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acknowledge the message, and every earlier delivery on the channel if `all_up_to` is set.
    ///
    /// Calling `ack` or `reject` on a message that has already been settled does nothing.
    #[tracing::instrument(name = "ack", skip_all, fields(delivery_tag = self.message.delivery_tag()))]
    pub async fn ack(&self, all_up_to: bool) -> Result<(), ConsumerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .channel
            .ack(self.message.delivery_tag(), all_up_to)
            .await;
        self.consumer.settle(ConsumerEvent::Consumed {
            message: self.message.clone(),
            all_up_to,
        });
        Ok(result?)
    }

    /// Negatively acknowledge the message, and every earlier delivery on the channel if
    /// `all_up_to` is set.
    ///
    /// Calling `ack` or `reject` on a message that has already been settled does nothing.
    #[tracing::instrument(name = "reject", skip_all, fields(delivery_tag = self.message.delivery_tag()))]
    pub async fn reject(&self, requeue: bool, all_up_to: bool) -> Result<(), ConsumerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .channel
            .nack(self.message.delivery_tag(), all_up_to, requeue)
            .await;
        self.consumer.settle(ConsumerEvent::Rejected {
            message: self.message.clone(),
            requeue,
            all_up_to,
        });
        Ok(result?)
    }

    /// Redeliver the message to its queue once `delay` has elapsed.
    ///
    /// A copy of the message is parked in the retry topology's holding queue with a TTL of
    /// `delay`, then the original delivery is rejected without requeueing.
    #[tracing::instrument(name = "retry", skip_all, fields(delivery_tag = self.message.delivery_tag()))]
    pub async fn retry(&self, delay: Duration) -> Result<(), ConsumerError> {
        let retry_topology = self
            .retry_topology
            .as_ref()
            .ok_or(ConsumerError::MissingRetryTopology)?;
        // Per-message TTLs have millisecond granularity.
        if delay.as_millis() == 0 {
            return Err(ConsumerError::InvalidRetryDelay);
        }
        let properties = self
            .message
            .properties()
            .clone()
            .with_expiration(expiration(delay));
        self.channel
            .publish(
                &retry_topology.pre_exchange,
                self.message.queue(),
                self.message.content(),
                properties,
            )
            .await?;
        self.reject(false, false).await
    }
}
