use crate::amqp::options::{BasicConsumeOptions, QueueDeclareOptions};
use crate::amqp::types::{AMQPValue, FieldTable};
use crate::consumers::result_handler::{DefaultResultHandler, ResultHandler};
use crate::consumers::ConsumerError;
use std::sync::Arc;

/// Everything a [`Consumer`](crate::consumers::Consumer) needs to know to subscribe to a queue.
///
/// Start from [`ConsumerOptions::for_queue`] (or [`ConsumerOptions::for_exchange`] to consume
/// from a broker-named queue bound to an exchange) and override the defaults you care about
/// with the `with_*` methods.
///
/// Defaults:
/// - the queue is asserted before consuming, as durable and not auto-deleted;
/// - messages must be acknowledged explicitly (`no_ack: false`);
/// - [`DefaultResultHandler`] acks successfully processed messages and rejects failed ones.
#[derive(Clone)]
pub struct ConsumerOptions {
    /// The queue to consume from.
    ///
    /// It can be omitted when `assert_queue` is `true`: the broker will generate a name.
    pub queue: Option<String>,
    /// Declare the queue on the broker, creating it if it does not exist.
    pub assert_queue: bool,
    pub assert_queue_options: QueueDeclareOptions,
    /// Extra arguments for the queue declaration, e.g. `x-max-length`.
    pub assert_queue_arguments: FieldTable,
    /// Bind the queue to this exchange before consuming.
    pub exchange: Option<String>,
    /// The binding pattern, only used together with `exchange`.
    pub pattern: String,
    pub bind_arguments: FieldTable,
    pub consume_options: BasicConsumeOptions,
    pub consume_arguments: FieldTable,
    /// Decides the fate of each message given the outcome of its processing.
    pub result_handler: Arc<dyn ResultHandler>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            queue: None,
            assert_queue: true,
            assert_queue_options: QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            assert_queue_arguments: FieldTable::default(),
            exchange: None,
            pattern: String::new(),
            bind_arguments: FieldTable::default(),
            consume_options: BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            consume_arguments: FieldTable::default(),
            result_handler: Arc::new(DefaultResultHandler),
        }
    }
}

impl std::fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("queue", &self.queue)
            .field("assert_queue", &self.assert_queue)
            .field("assert_queue_options", &self.assert_queue_options)
            .field("exchange", &self.exchange)
            .field("pattern", &self.pattern)
            .field("consume_options", &self.consume_options)
            .finish_non_exhaustive()
    }
}

impl ConsumerOptions {
    /// Consume from `queue`.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Default::default()
        }
    }

    /// Consume from a queue named by the broker, bound to `exchange` with `pattern`.
    pub fn for_exchange(exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            exchange: Some(exchange.into()),
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    pub fn with_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..self
        }
    }

    /// Bind the queue to `exchange` with `pattern`.
    pub fn with_exchange(self, exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            exchange: Some(exchange.into()),
            pattern: pattern.into(),
            ..self
        }
    }

    pub fn with_bind_arguments(self, bind_arguments: FieldTable) -> Self {
        Self {
            bind_arguments,
            ..self
        }
    }

    /// Consume from the configured queue as-is, without declaring it first.
    pub fn without_queue_assertion(self) -> Self {
        Self {
            assert_queue: false,
            ..self
        }
    }

    pub fn with_queue_options(self, assert_queue_options: QueueDeclareOptions) -> Self {
        Self {
            assert_queue_options,
            ..self
        }
    }

    pub fn with_queue_arguments(self, assert_queue_arguments: FieldTable) -> Self {
        Self {
            assert_queue_arguments,
            ..self
        }
    }

    pub fn with_consume_options(self, consume_options: BasicConsumeOptions) -> Self {
        Self {
            consume_options,
            ..self
        }
    }

    pub fn with_consume_arguments(self, consume_arguments: FieldTable) -> Self {
        Self {
            consume_arguments,
            ..self
        }
    }

    /// Set the [consumer priority](https://www.rabbitmq.com/consumer-priority.html).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.consume_arguments
            .insert("x-priority".into(), AMQPValue::LongInt(priority));
        self
    }

    pub fn with_result_handler<R: ResultHandler>(self, result_handler: R) -> Self {
        Self {
            result_handler: Arc::new(result_handler),
            ..self
        }
    }

    /// An anonymous queue that is not asserted cannot be bound to an exchange.
    pub(crate) fn validate(&self) -> Result<(), ConsumerError> {
        if !self.assert_queue
            && self.exchange.is_some()
            && self.queue.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConsumerError::InvalidPolicy(
                "a queue name is required to bind to an exchange when the queue is not asserted"
                    .into(),
            ));
        }
        Ok(())
    }
}
