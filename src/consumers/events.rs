use crate::consumers::Message;
use std::sync::Arc;

/// Signals emitted by a [`Consumer`](crate::consumers::Consumer).
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// A subscription has been established on the broker.
    Started { queue: String, consumer_tag: String },
    /// The subscription has been cancelled.
    Stopped { queue: String, consumer_tag: String },
    /// A message has been acknowledged.
    Consumed { message: Message, all_up_to: bool },
    /// A message has been rejected.
    Rejected {
        message: Message,
        requeue: bool,
        all_up_to: bool,
    },
    /// The message handler failed, either returning an error or panicking.
    ConsumerError(Arc<anyhow::Error>),
    /// The result handler failed to settle a message.
    Error(Arc<anyhow::Error>),
    /// The last outstanding message has been settled.
    AllConsumed,
}
