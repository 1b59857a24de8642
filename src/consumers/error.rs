/// Failures surfaced by [`Consumer`](crate::consumers::Consumer),
/// [`ResultContext`](crate::consumers::ResultContext) and
/// [`ConsumerManager`](crate::consumers::ConsumerManager).
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Invalid consumer options: {0}")]
    InvalidPolicy(String),
    #[error("The consumer has already been stopped")]
    AlreadyStopped,
    #[error("The consumer is already consuming")]
    AlreadyResumed,
    #[error("The consumer is not attached to a channel")]
    NoChannel,
    #[error("A retry topology must be configured to retry messages")]
    MissingRetryTopology,
    #[error("The retry delay must be greater than zero")]
    InvalidRetryDelay,
    /// An operation on the broker failed.
    #[error(transparent)]
    Broker(#[from] anyhow::Error),
}
