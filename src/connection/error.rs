use std::sync::Arc;

/// Failures surfaced by [`ConnectionManager`](crate::connection::ConnectionManager).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// Every connection attempt allowed by the [`ReconnectPolicy`](crate::connection::ReconnectPolicy) failed.
    #[error("Failed to connect to RabbitMQ after {attempts} retries")]
    RetriesExhausted {
        attempts: u32,
        /// Why the last attempt failed.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl ConnectionError {
    pub(crate) fn retries_exhausted(attempts: u32, last_error: anyhow::Error) -> Self {
        let source: Box<dyn std::error::Error + Send + Sync + 'static> = last_error.into();
        Self::RetriesExhausted {
            attempts,
            source: Arc::from(source),
        }
    }
}
