//! Keep a connection to RabbitMq alive.
//!
//! [`ConnectionManager`] establishes the connection with backoff, re-establishes it when it is
//! lost and re-attaches the registered consumers to every new channel.
mod backoff;
mod error;
mod events;
mod manager;

pub use backoff::{BackoffStrategy, ReconnectPolicy};
pub use error::ConnectionError;
pub use events::ConnectionEvent;
pub use manager::{ChannelHook, ConnectionManager};

pub(crate) use manager::stop_all;
