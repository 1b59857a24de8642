use crate::amqp::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use crate::amqp::types::{AMQPValue, FieldTable};
use crate::amqp::ExchangeKind;
use crate::transport::BrokerChannel;
use serde::Deserialize;

/// Names of the broker objects implementing delayed redelivery.
///
/// A message scheduled for retry is published to `pre_exchange`, routed by the name of the
/// queue it was consumed from. `pre_exchange` forwards every message to `queue`, where it waits
/// for its per-message TTL to expire. Expired messages are dead-lettered to `post_exchange`,
/// which routes them back to the originating queue: every consumer that participates binds its
/// own queue to `post_exchange` using the queue name as binding key.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    /// Topic exchange receiving the messages to be retried.
    pub pre_exchange: String,
    /// Direct exchange receiving the messages whose delay has elapsed.
    pub post_exchange: String,
    /// The queue holding messages while they wait to be retried.
    pub queue: String,
}

impl RetryTopology {
    pub fn new(
        pre_exchange: impl Into<String>,
        post_exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            pre_exchange: pre_exchange.into(),
            post_exchange: post_exchange.into(),
            queue: queue.into(),
        }
    }

    /// Declare the exchanges and the holding queue, and bind them together.
    ///
    /// Every step is idempotent: it is safe to run on every new channel.
    #[tracing::instrument(name = "assert_retry_topology", skip_all, fields(queue = %self.queue))]
    pub async fn assert(&self, channel: &dyn BrokerChannel) -> Result<(), anyhow::Error> {
        channel
            .assert_exchange(
                &self.pre_exchange,
                ExchangeKind::Topic,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        channel
            .assert_exchange(
                &self.post_exchange,
                ExchangeKind::Direct,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.post_exchange.clone().into()),
        );
        channel
            .assert_queue(
                &self.queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                arguments,
            )
            .await?;
        // `*` only matches single-word routing keys: queue names containing a dot are not
        // routed to the holding queue.
        channel
            .bind_queue(&self.queue, &self.pre_exchange, "*", FieldTable::default())
            .await?;
        Ok(())
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        passive: false,
        durable: true,
        auto_delete: false,
        internal: false,
        nowait: false,
    }
}
