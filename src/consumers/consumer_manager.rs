use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::ConnectionFactory;
use crate::connection::{
    stop_all, ChannelHook, ConnectionError, ConnectionManager, ReconnectPolicy,
};
use crate::consumers::{
    Consumer, ConsumerError, ConsumerOptions, MessageHandler, RetryTopology,
};
use crate::transport::{BrokerChannel, Connector};
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::Mutex;
use tracing::{error, info};

/// How many unacknowledged messages a channel may hold, unless configured otherwise.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Configuration for a [`ConsumerManager`] connected to RabbitMq via [`ConnectionFactory`].
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerManagerSettings {
    pub rabbitmq: RabbitMqSettings,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Applied once to every new channel, and shared by all consumers.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    /// Delayed retries are only available when set.
    #[serde(default)]
    pub retry_topology: Option<RetryTopology>,
}

fn default_prefetch_count() -> u16 {
    DEFAULT_PREFETCH_COUNT
}

/// Runs a set of [`Consumer`]s on top of a [`ConnectionManager`].
///
/// On every new channel the manager applies its prefetch count, asserts the delayed-retry
/// topology (if any), then re-attaches its consumers one at a time, in registration order.
///
/// `ConsumerManager` is a cheap handle: clones refer to the same set of consumers.
#[derive(Clone)]
pub struct ConsumerManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connection_manager: ConnectionManager,
    /// Also serialises channel hand-over, see [`ConnectionManager`].
    consumers: Mutex<Vec<Consumer>>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    retry_topology: RwLock<Option<Arc<RetryTopology>>>,
    prefetch_count: u16,
}

/// Ties the manager to the channel broadcasts of its [`ConnectionManager`].
///
/// It only holds a weak reference: the connection manager must not keep the consumer
/// manager alive.
struct ManagerHook(Weak<ManagerInner>);

#[async_trait::async_trait]
impl ChannelHook for ManagerHook {
    async fn on_channel(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), anyhow::Error> {
        match self.0.upgrade() {
            Some(inner) => inner.on_channel(channel).await,
            None => Ok(()),
        }
    }

    async fn on_channel_lost(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_channel_lost().await;
        }
    }
}

impl ConsumerManager {
    /// Manage consumers on the connections established by `connection_manager`.
    ///
    /// If the connection manager is already connected, its current channel is adopted.
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self::with_prefetch_count(connection_manager, DEFAULT_PREFETCH_COUNT)
    }

    pub fn with_prefetch_count(connection_manager: ConnectionManager, prefetch_count: u16) -> Self {
        let inner = Arc::new(ManagerInner {
            channel: RwLock::new(connection_manager.channel()),
            connection_manager: connection_manager.clone(),
            consumers: Mutex::new(Vec::new()),
            retry_topology: RwLock::new(None),
            prefetch_count,
        });
        connection_manager.add_channel_hook(Arc::new(ManagerHook(Arc::downgrade(&inner))));
        Self { inner }
    }

    /// Build a [`ConnectionManager`] on top of `connector`, wrap it and connect.
    pub async fn connect<C: Connector>(
        connector: C,
        reconnect_policy: ReconnectPolicy,
    ) -> Result<Self, ConnectionError> {
        let manager = Self::new(ConnectionManager::new(connector, reconnect_policy));
        manager.inner.connection_manager.connect().await?;
        Ok(manager)
    }

    /// Connect to RabbitMq as described by `settings`.
    pub async fn from_settings(settings: &ConsumerManagerSettings) -> Result<Self, anyhow::Error> {
        let connector = ConnectionFactory::new_from_config(&settings.rabbitmq)?;
        let manager = Self::with_prefetch_count(
            ConnectionManager::new(connector, settings.reconnect.clone()),
            settings.prefetch_count,
        );
        if let Some(retry_topology) = &settings.retry_topology {
            manager
                .setup_delayed_retry_topology(retry_topology.clone())
                .await?;
        }
        manager.inner.connection_manager.connect().await?;
        Ok(manager)
    }

    /// Create a consumer and register it.
    ///
    /// The manager-wide retry topology, if any, is applied before the consumer is attached to
    /// the current channel.
    pub async fn consume<H: MessageHandler>(
        &self,
        handler: H,
        options: ConsumerOptions,
    ) -> Result<Consumer, ConsumerError> {
        let consumer = Consumer::new(handler, options)?;
        let mut consumers = self.inner.consumers.lock().await;
        if let Some(retry_topology) = self.retry_topology() {
            consumer.set_retry_topology(retry_topology).await?;
        }
        if let Some(channel) = self.inner.channel() {
            consumer.set_channel(Some(channel)).await?;
        }
        consumers.push(consumer.clone());
        Ok(consumer)
    }

    /// Enable delayed retries for every consumer of this manager, current and future.
    ///
    /// The topology is asserted on the current channel, if any, and on every new channel.
    #[tracing::instrument(name = "setup_delayed_retry_topology", skip(self))]
    pub async fn setup_delayed_retry_topology(
        &self,
        retry_topology: RetryTopology,
    ) -> Result<(), ConsumerError> {
        let retry_topology = Arc::new(retry_topology);
        let consumers = self.inner.consumers.lock().await;
        *self
            .inner
            .retry_topology
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&retry_topology));
        if let Some(channel) = self.inner.channel() {
            retry_topology.assert(channel.as_ref()).await?;
        }
        for consumer in consumers.iter() {
            consumer
                .set_retry_topology(Arc::clone(&retry_topology))
                .await?;
        }
        Ok(())
    }

    /// Stop every consumer that is currently consuming.
    pub async fn stop_all_consumers(&self) -> Result<(), ConsumerError> {
        let consumers = self.consumers().await;
        stop_all(&consumers).await
    }

    /// Stop all consumers, wait for the messages they are processing to be settled, then
    /// disconnect.
    #[tracing::instrument(name = "consumer_manager_shutdown", skip(self))]
    pub async fn shutdown(&self) -> Result<(), anyhow::Error> {
        let stopped = self.stop_all_consumers().await;
        for consumer in self.consumers().await {
            consumer.wait_until_idle().await;
        }
        info!("All consumers are idle");
        self.inner.connection_manager.disconnect().await?;
        Ok(stopped?)
    }

    /// Wait for `shutdown` to resolve, then shut down gracefully.
    pub async fn run_until_shutdown(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        shutdown.await;
        info!("Shutdown signal received");
        self.shutdown().await
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.inner.connection_manager
    }

    /// The registered consumers, in registration order.
    pub async fn consumers(&self) -> Vec<Consumer> {
        self.inner.consumers.lock().await.clone()
    }

    pub fn retry_topology(&self) -> Option<Arc<RetryTopology>> {
        self.inner
            .retry_topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn prefetch_count(&self) -> u16 {
        self.inner.prefetch_count
    }
}

impl ManagerInner {
    /// Consumers are re-attached even if the channel could not be fully prepared: they are
    /// detached at this point, and would otherwise stay idle on a live connection.
    /// The preparation failure is returned once they have been re-attached.
    async fn on_channel(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), anyhow::Error> {
        let consumers = self.consumers.lock().await;
        *self.channel_mut() = Some(Arc::clone(&channel));

        let prepared = self.prepare_channel(channel.as_ref()).await;
        if let Err(e) = &prepared {
            error!("Failed to prepare the new channel: {:?}", e);
        }
        for consumer in consumers.iter() {
            if let Err(e) = consumer.set_channel(Some(Arc::clone(&channel))).await {
                error!(queue = ?consumer.queue(), "Failed to re-attach consumer: {:?}", e);
            }
        }
        prepared
    }

    async fn prepare_channel(&self, channel: &dyn BrokerChannel) -> Result<(), anyhow::Error> {
        channel.prefetch(self.prefetch_count).await?;
        let retry_topology = self
            .retry_topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(retry_topology) = retry_topology {
            retry_topology.assert(channel).await?;
        }
        Ok(())
    }

    async fn on_channel_lost(&self) {
        let consumers = self.consumers.lock().await;
        *self.channel_mut() = None;
        for consumer in consumers.iter() {
            if let Err(e) = consumer.set_channel(None).await {
                error!(queue = ?consumer.queue(), "Failed to detach consumer: {:?}", e);
            }
        }
    }

    /// The channel handed over by the connection manager, unless it has been closed since.
    fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        if !self.connection_manager.is_connected() {
            return None;
        }
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn channel_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn BrokerChannel>>> {
        self.channel.write().unwrap_or_else(PoisonError::into_inner)
    }
}
