//! Facilities to consume messages from RabbitMq queues across reconnections. Check out
//! [`ConsumerManager`] as a starting point.
pub use consumer::Consumer;
pub use consumer_manager::{ConsumerManager, ConsumerManagerSettings, DEFAULT_PREFETCH_COUNT};
pub use error::ConsumerError;
pub use events::ConsumerEvent;
pub use handler::{ClosureHandler, MessageHandler};
pub use message::Message;
pub use options::ConsumerOptions;
pub use result_handler::{DefaultResultHandler, ResultContext, ResultHandler};
pub use retry_topology::RetryTopology;

mod consumer;
mod consumer_manager;
mod error;
mod events;
mod handler;
mod message;
mod options;
mod result_handler;
mod retry_topology;
