use crate::connection::ConnectionError;
use crate::consumers::Consumer;
use crate::transport::BrokerChannel;
use std::sync::Arc;
use std::time::Duration;

/// Signals emitted by a [`ConnectionManager`](crate::connection::ConnectionManager).
#[derive(Clone)]
pub enum ConnectionEvent {
    /// A physical connection has been established.
    Connected,
    /// A new channel is available. Registered consumers are re-attached right after.
    Channel(Arc<dyn BrokerChannel>),
    /// A consumer has been registered.
    Consumer(Consumer),
    /// A connection attempt failed and will be retried after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The connection could not be (re-)established.
    Error(ConnectionError),
    /// The connection was closed. `error` is set if it was terminated abnormally.
    Disconnected { error: Option<Arc<anyhow::Error>> },
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("Connected"),
            Self::Channel(_) => f.write_str("Channel"),
            Self::Consumer(consumer) => f.debug_tuple("Consumer").field(consumer).finish(),
            Self::Retry { attempt, delay } => f
                .debug_struct("Retry")
                .field("attempt", attempt)
                .field("delay", delay)
                .finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Disconnected { error } => f
                .debug_struct("Disconnected")
                .field("error", error)
                .finish(),
        }
    }
}
