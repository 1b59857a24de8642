use crate::connection::{ConnectionError, ConnectionEvent, ReconnectPolicy};
use crate::consumers::{Consumer, ConsumerError, ConsumerOptions, MessageHandler};
use crate::events::Listeners;
use crate::transport::{BrokerChannel, BrokerConnection, Connector};
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Asynchronous reactions to the availability of a new channel.
///
/// Hooks are awaited one after the other, in registration order, before the consumers
/// registered on the [`ConnectionManager`] are re-attached.
#[async_trait::async_trait]
pub trait ChannelHook: Send + Sync + 'static {
    async fn on_channel(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), anyhow::Error>;

    /// The connection was lost abnormally: the last channel is no longer usable.
    async fn on_channel_lost(&self) {}
}

/// Owns the connection to RabbitMq and keeps it alive.
///
/// When the connection is terminated abnormally, a new one is established following the
/// [`ReconnectPolicy`] and every registered [`Consumer`] is attached to the new channel.
/// A graceful close, e.g. via [`ConnectionManager::disconnect`], is final.
///
/// `ConnectionManager` is a cheap handle: clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    reconnect_policy: ReconnectPolicy,
    established: RwLock<Option<Established>>,
    /// Also serialises channel hand-over: a consumer is registered either before or after
    /// a new channel is broadcast, never in between.
    consumers: Mutex<Vec<Consumer>>,
    /// Only one connection loop runs at a time.
    connecting: Mutex<()>,
    hooks: RwLock<Vec<Arc<dyn ChannelHook>>>,
    listeners: Listeners<ConnectionEvent>,
    /// Incremented for every connection, so close notifications of replaced connections can
    /// be told apart.
    generation: AtomicU64,
    /// Set by `disconnect`, cleared by `connect`: automatic reconnection stops when set.
    disconnect_requested: AtomicBool,
}

#[derive(Clone)]
struct Established {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

impl ConnectionManager {
    pub fn new<C: Connector>(connector: C, reconnect_policy: ReconnectPolicy) -> Self {
        Self::from_arc(Arc::new(connector), reconnect_policy)
    }

    pub fn from_arc(connector: Arc<dyn Connector>, reconnect_policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect_policy,
                established: RwLock::new(None),
                consumers: Mutex::new(Vec::new()),
                connecting: Mutex::new(()),
                hooks: RwLock::new(Vec::new()),
                listeners: Listeners::default(),
                generation: AtomicU64::new(0),
                disconnect_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Establish a connection and a channel, retrying according to the [`ReconnectPolicy`].
    ///
    /// If a connection already exists it is replaced.
    /// Once the retry budget is exhausted a [`ConnectionEvent::Error`] is emitted and the
    /// same error is returned.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner
            .disconnect_requested
            .store(false, Ordering::SeqCst);
        Inner::connect(&self.inner, false).await
    }

    /// Gracefully close the connection, if any.
    ///
    /// Consumers are not stopped: call [`ConnectionManager::stop_all_consumers`] first to
    /// cancel their subscriptions.
    #[tracing::instrument(name = "rabbitmq_disconnect", skip(self))]
    pub async fn disconnect(&self) -> Result<(), anyhow::Error> {
        self.inner.disconnect_requested.store(true, Ordering::SeqCst);
        let established = self.inner.established_mut().take();
        if let Some(established) = established {
            established.connection.close().await?;
            info!("Disconnected from RabbitMQ");
        }
        Ok(())
    }

    /// Create a consumer and register it.
    ///
    /// It is attached straight away if a channel is available, and re-attached to every new
    /// channel afterwards.
    pub async fn consume<H: MessageHandler>(
        &self,
        options: ConsumerOptions,
        handler: H,
    ) -> Result<Consumer, ConsumerError> {
        let consumer = Consumer::new(handler, options)?;
        let mut consumers = self.inner.consumers.lock().await;
        if let Some(channel) = self.channel() {
            consumer.set_channel(Some(channel)).await?;
        }
        consumers.push(consumer.clone());
        drop(consumers);
        self.inner
            .listeners
            .emit(&ConnectionEvent::Consumer(consumer.clone()));
        Ok(consumer)
    }

    /// Stop every registered consumer that is currently consuming.
    ///
    /// All consumers are stopped even if some fail; the first failure is returned.
    pub async fn stop_all_consumers(&self) -> Result<(), ConsumerError> {
        let consumers = self.consumers().await;
        stop_all(&consumers).await
    }

    /// Register a hook to be run every time a new channel is established.
    pub fn add_channel_hook(&self, hook: Arc<dyn ChannelHook>) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Register a callback invoked for every [`ConnectionEvent`].
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.established().is_some()
    }

    /// The current channel, if connected.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner
            .established()
            .as_ref()
            .map(|established| Arc::clone(&established.channel))
    }

    /// The registered consumers, in registration order.
    pub async fn consumers(&self) -> Vec<Consumer> {
        self.inner.consumers.lock().await.clone()
    }
}

impl Inner {
    #[tracing::instrument(name = "rabbitmq_connect_with_backoff", skip(self))]
    async fn connect(self: &Arc<Self>, reconnecting: bool) -> Result<(), ConnectionError> {
        let _connecting = self.connecting.lock().await;
        let mut backoff = self.reconnect_policy.backoff();
        loop {
            if reconnecting && self.disconnect_requested.load(Ordering::SeqCst) {
                info!("Disconnection requested, no longer trying to reconnect");
                return Ok(());
            }
            let e = match self.establish().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            match backoff.next() {
                Some((attempt, delay)) => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to connect to RabbitMQ, retrying: {:?}", e
                    );
                    self.listeners
                        .emit(&ConnectionEvent::Retry { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let e = ConnectionError::retries_exhausted(backoff.attempts(), e);
                    error!("Giving up on connecting to RabbitMQ: {:?}", e);
                    self.listeners.emit(&ConnectionEvent::Error(e.clone()));
                    return Err(e);
                }
            }
        }
    }

    /// A single attempt at opening a connection and a channel.
    async fn establish(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        let connection = self.connector.connect().await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_error) = connection.close().await {
                    debug!("Failed to close half-open connection: {:?}", close_error);
                }
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let runtime = Handle::try_current()?;
        connection.on_close(Box::new(move |error| {
            runtime.spawn(Inner::on_connection_closed(weak, generation, error));
        }));

        info!(generation, "Connected to RabbitMQ");
        let previous = self.on_channel(connection, channel, generation).await;
        if let Some(previous) = previous {
            if let Err(e) = previous.connection.close().await {
                debug!("Failed to close replaced connection: {:?}", e);
            }
        }
        Ok(())
    }

    /// Publish the new connection and hand its channel to hooks and consumers.
    ///
    /// It returns the connection that has been replaced, if any.
    async fn on_channel(
        &self,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
        generation: u64,
    ) -> Option<Established> {
        let consumers = self.consumers.lock().await;
        let previous = self.established_mut().replace(Established {
            connection,
            channel: Arc::clone(&channel),
            generation,
        });
        self.listeners.emit(&ConnectionEvent::Connected);
        self.listeners
            .emit(&ConnectionEvent::Channel(Arc::clone(&channel)));

        for hook in self.hooks() {
            if let Err(e) = hook.on_channel(Arc::clone(&channel)).await {
                error!("Channel hook failed: {:?}", e);
            }
        }
        for consumer in consumers.iter() {
            if let Err(e) = consumer.set_channel(Some(Arc::clone(&channel))).await {
                error!(queue = ?consumer.queue(), "Failed to re-attach consumer: {:?}", e);
            }
        }
        previous
    }

    fn on_connection_closed(
        inner: Weak<Self>,
        generation: u64,
        error: Option<anyhow::Error>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let error = error.map(Arc::new);
            inner.listeners.emit(&ConnectionEvent::Disconnected {
                error: error.clone(),
            });
            let Some(error) = error else {
                debug!(generation, "RabbitMQ connection closed gracefully");
                return;
            };
            // Only the loss of the latest connection triggers a reconnection.
            if inner.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "Ignoring the loss of a replaced connection");
                return;
            }
            warn!(generation, "RabbitMQ connection lost: {:?}", error);

            {
                let consumers = inner.consumers.lock().await;
                {
                    let mut established = inner.established_mut();
                    if established.as_ref().map(|e| e.generation) == Some(generation) {
                        *established = None;
                    }
                }
                for hook in inner.hooks() {
                    hook.on_channel_lost().await;
                }
                for consumer in consumers.iter() {
                    if let Err(e) = consumer.set_channel(None).await {
                        debug!("Failed to detach consumer: {:?}", e);
                    }
                }
            }

            info!("Reconnecting to RabbitMQ");
            if let Err(e) = Inner::connect(&inner, true).await {
                error!("Failed to reconnect to RabbitMQ: {:?}", e);
            }
        }
        .boxed()
    }

    fn hooks(&self) -> Vec<Arc<dyn ChannelHook>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn established(&self) -> std::sync::RwLockReadGuard<'_, Option<Established>> {
        self.established
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn established_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Established>> {
        self.established
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stop every consumer that is consuming, returning the first failure.
pub(crate) async fn stop_all(consumers: &[Consumer]) -> Result<(), ConsumerError> {
    let mut first_error = None;
    for consumer in consumers.iter().filter(|c| c.is_consuming()) {
        if let Err(e) = consumer.stop().await {
            error!(queue = ?consumer.queue(), "Failed to stop consumer: {:?}", e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
