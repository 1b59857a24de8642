use crate::consumers::{
    ConsumerError, ConsumerEvent, ConsumerOptions, Message, MessageHandler, ResultContext,
    RetryTopology,
};
use crate::events::Listeners;
use crate::transport::{BrokerChannel, Delivery, DeliveryCallback};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, warn};

/// A subscription to a RabbitMq queue that survives the loss of the channel it was
/// established on.
///
/// A `Consumer` does not own a channel: it is handed one by its manager via
/// [`Consumer::set_channel`] every time a new channel becomes available, and re-subscribes
/// to its queue - re-asserting and re-binding it first - each time.
///
/// Handlers are started in the order the broker delivered the messages, and run concurrently:
/// a slow message does not prevent the consumer from starting on the next one. Prefetch limits
/// how many messages are in flight.
///
/// `Consumer` is a cheap handle: clones refer to the same subscription.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    options: ConsumerOptions,
    handler: Arc<dyn MessageHandler>,
    /// Serialises `set_channel`, `stop`, `resume` and `set_retry_topology`.
    lifecycle: Mutex<Option<Arc<dyn BrokerChannel>>>,
    state: RwLock<State>,
    consuming: AtomicBool,
    ongoing: AtomicUsize,
    idle: Notify,
    listeners: Listeners<ConsumerEvent>,
}

#[derive(Default)]
struct State {
    queue: Option<String>,
    consumer_tag: Option<String>,
    retry_topology: Option<Arc<RetryTopology>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Consumer")
            .field("queue", &state.queue)
            .field("consumer_tag", &state.consumer_tag)
            .field("consuming", &self.is_consuming())
            .field("ongoing_consumptions", &self.ongoing_consumptions())
            .finish()
    }
}

impl Consumer {
    /// Create a consumer that is not attached to any channel.
    ///
    /// It fails if `options` describe a subscription that cannot be established.
    pub fn new<H: MessageHandler>(
        handler: H,
        options: ConsumerOptions,
    ) -> Result<Self, ConsumerError> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(ConsumerInner {
                options,
                handler: Arc::new(handler),
                lifecycle: Mutex::new(None),
                state: RwLock::new(State::default()),
                consuming: AtomicBool::new(false),
                ongoing: AtomicUsize::new(0),
                idle: Notify::new(),
                listeners: Listeners::default(),
            }),
        })
    }

    /// Attach the consumer to `channel` and subscribe to its queue.
    ///
    /// `None` detaches the consumer: it stops consuming until it is given a new channel.
    /// The subscription on the previous channel, if any, is not cancelled - the channel is
    /// assumed to be gone.
    pub async fn set_channel(
        &self,
        channel: Option<Arc<dyn BrokerChannel>>,
    ) -> Result<(), ConsumerError> {
        let mut attached = self.inner.lifecycle.lock().await;
        *attached = channel.clone();
        match channel {
            None => {
                debug!(queue = ?self.queue(), "Consumer detached from its channel");
                self.inner.consuming.store(false, Ordering::SeqCst);
                Ok(())
            }
            Some(channel) => self.start_consumption(channel).await,
        }
    }

    /// Use `retry_topology` for delayed retries.
    ///
    /// If the consumer is already attached to a channel, its queue is bound to the
    /// post-retry exchange straight away. Otherwise the binding happens on the next
    /// subscription.
    pub async fn set_retry_topology(
        &self,
        retry_topology: Arc<RetryTopology>,
    ) -> Result<(), ConsumerError> {
        let attached = self.inner.lifecycle.lock().await;
        let queue = {
            let mut state = self.inner.state_mut();
            state.retry_topology = Some(Arc::clone(&retry_topology));
            state.queue.clone()
        };
        if let (Some(channel), Some(queue)) = (attached.as_ref(), queue) {
            bind_to_retry_topology(channel.as_ref(), &queue, &retry_topology).await?;
        }
        Ok(())
    }

    /// Cancel the subscription. The consumer stays attached to its channel.
    ///
    /// Messages that are already being processed are not affected: they will still be settled.
    #[tracing::instrument(name = "consumer_stop", skip(self), fields(queue = ?self.queue()))]
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let attached = self.inner.lifecycle.lock().await;
        if !self.is_consuming() {
            return Err(ConsumerError::AlreadyStopped);
        }
        let (queue, consumer_tag) = {
            let state = self.inner.state();
            (
                state.queue.clone().unwrap_or_default(),
                state.consumer_tag.clone().unwrap_or_default(),
            )
        };
        let channel = attached.as_ref().ok_or(ConsumerError::NoChannel)?;
        channel.cancel(&consumer_tag).await?;
        self.inner.consuming.store(false, Ordering::SeqCst);
        debug!(consumer_tag = %consumer_tag, "Consumer stopped");
        self.inner.listeners.emit(&ConsumerEvent::Stopped {
            queue,
            consumer_tag,
        });
        Ok(())
    }

    /// Subscribe again after [`Consumer::stop`], reusing the previous consumer tag.
    #[tracing::instrument(name = "consumer_resume", skip(self), fields(queue = ?self.queue()))]
    pub async fn resume(&self) -> Result<(), ConsumerError> {
        let attached = self.inner.lifecycle.lock().await;
        if self.is_consuming() {
            return Err(ConsumerError::AlreadyResumed);
        }
        let channel = attached.clone().ok_or(ConsumerError::NoChannel)?;
        self.start_consumption(channel).await
    }

    /// Assert and bind the queue, then subscribe to it.
    ///
    /// The caller must hold the lifecycle lock.
    #[tracing::instrument(name = "consumer_start", skip_all)]
    async fn start_consumption(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), ConsumerError> {
        self.inner.consuming.store(false, Ordering::SeqCst);
        let options = &self.inner.options;

        let queue = if options.assert_queue {
            channel
                .assert_queue(
                    options.queue.as_deref().unwrap_or_default(),
                    options.assert_queue_options.clone(),
                    options.assert_queue_arguments.clone(),
                )
                .await?
        } else {
            options.queue.clone().unwrap_or_default()
        };
        let (consumer_tag, retry_topology) = {
            let mut state = self.inner.state_mut();
            state.queue = Some(queue.clone());
            (state.consumer_tag.clone(), state.retry_topology.clone())
        };

        if let Some(exchange) = &options.exchange {
            channel
                .bind_queue(
                    &queue,
                    exchange,
                    &options.pattern,
                    options.bind_arguments.clone(),
                )
                .await?;
        }
        if let Some(retry_topology) = &retry_topology {
            bind_to_retry_topology(channel.as_ref(), &queue, retry_topology).await?;
        }

        let consumer_tag = channel
            .consume(
                &queue,
                consumer_tag.as_deref(),
                options.consume_options.clone(),
                options.consume_arguments.clone(),
                self.delivery_callback(Arc::clone(&channel), queue.clone())?,
            )
            .await?;

        self.inner.state_mut().consumer_tag = Some(consumer_tag.clone());
        self.inner.consuming.store(true, Ordering::SeqCst);
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");
        self.inner.listeners.emit(&ConsumerEvent::Started {
            queue,
            consumer_tag,
        });
        Ok(())
    }

    /// Deliveries are queued, in the order the broker pushed them, to a dispatcher task owned
    /// by this subscription. The dispatcher starts handlers in that order and drives them
    /// concurrently.
    ///
    /// Both the callback and the dispatcher hold weak references: a subscription that outlives
    /// every handle to its consumer drops its deliveries on the floor.
    fn delivery_callback(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: String,
    ) -> Result<DeliveryCallback, anyhow::Error> {
        let runtime = Handle::try_current()?;
        let (sender, receiver) = mpsc::unbounded_channel::<Message>();
        runtime.spawn(dispatch(Arc::downgrade(&self.inner), channel, receiver));

        let consumer = Arc::downgrade(&self.inner);
        Ok(Arc::new(move |delivery: Option<Delivery>| {
            let Some(delivery) = delivery else {
                debug!(queue = %queue, "Subscription cancelled by the broker");
                return;
            };
            let Some(inner) = Weak::upgrade(&consumer) else {
                warn!(queue = %queue, "Delivery received for a dropped consumer");
                return;
            };
            // Counted on receipt: `wait_until_idle` covers deliveries still queued.
            inner.ongoing.fetch_add(1, Ordering::SeqCst);
            if sender.send(Message::new(delivery, &queue)).is_err() {
                error!(queue = %queue, "The dispatcher is gone, dropping delivery");
                Consumer { inner }.release();
            }
        }))
    }

    /// Run the message handler, then the result handler, for a single delivery.
    async fn process(self, channel: Arc<dyn BrokerChannel>, message: Message) {
        let retry_topology = self.inner.state().retry_topology.clone();
        let handler = Arc::clone(&self.inner.handler);
        let result_handler = Arc::clone(&self.inner.options.result_handler);
        let listeners = &self.inner.listeners;
        let context = ResultContext::new(message, channel, self.clone(), retry_topology);

        let outcome = AssertUnwindSafe(handler.handle(context.message()))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_to_error(payload)));

        if let Err(e) = &outcome {
            warn!(
                queue = %context.message().queue(),
                delivery_tag = context.message().delivery_tag(),
                "Failed to process message: {:?}", e
            );
        }

        if let Err(e) = result_handler.handle(&context, &outcome).await {
            error!(
                delivery_tag = context.message().delivery_tag(),
                "Result handler failed: {:?}", e
            );
            listeners.emit(&ConsumerEvent::Error(Arc::new(e)));
        }
        if !context.is_settled() {
            warn!(
                delivery_tag = context.message().delivery_tag(),
                "Message left unsettled by the result handler, rejecting it with requeue"
            );
            if let Err(e) = context.reject(true, false).await {
                error!("Failed to reject unsettled message: {:?}", e);
            }
        }

        if let Err(e) = outcome {
            listeners.emit(&ConsumerEvent::ConsumerError(Arc::new(e)));
        }
    }

    /// Record that one delivery has been acked or rejected.
    pub(crate) fn settle(&self, event: ConsumerEvent) {
        self.inner.listeners.emit(&event);
        self.release();
    }

    /// Stop counting one delivery as ongoing.
    fn release(&self) {
        let previous = self
            .inner
            .ongoing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.inner.idle.notify_waiters();
            self.inner.listeners.emit(&ConsumerEvent::AllConsumed);
        }
    }

    /// Wait until every message received so far has been settled.
    pub async fn wait_until_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.ongoing_consumptions() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Register a callback invoked for every [`ConsumerEvent`] emitted by this consumer.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&ConsumerEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener);
    }

    pub fn is_consuming(&self) -> bool {
        self.inner.consuming.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_consuming()
    }

    /// The name of the queue, once it has been resolved by the first subscription.
    pub fn queue(&self) -> Option<String> {
        self.inner.state().queue.clone()
    }

    /// The tag of the current (or last) subscription.
    pub fn consumer_tag(&self) -> Option<String> {
        self.inner.state().consumer_tag.clone()
    }

    pub fn retry_topology(&self) -> Option<Arc<RetryTopology>> {
        self.inner.state().retry_topology.clone()
    }

    /// How many received messages are still waiting to be settled.
    pub fn ongoing_consumptions(&self) -> usize {
        self.inner.ongoing.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.inner.options
    }
}

impl ConsumerInner {
    fn state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receives the deliveries of one subscription, in order, until the subscription ends.
async fn dispatch(
    consumer: Weak<ConsumerInner>,
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: mpsc::UnboundedReceiver<Message>,
) {
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            // Deliveries are pushed before in-flight work is polled: `FuturesUnordered` polls
            // newly pushed futures in insertion order.
            biased;
            delivery = deliveries.recv() => {
                let Some(message) = delivery else { break };
                let Some(inner) = consumer.upgrade() else { break };
                in_flight.push(Consumer { inner }.process(Arc::clone(&channel), message));
            }
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }
    while in_flight.next().await.is_some() {}
}

async fn bind_to_retry_topology(
    channel: &dyn BrokerChannel,
    queue: &str,
    retry_topology: &RetryTopology,
) -> Result<(), anyhow::Error> {
    channel
        .bind_queue(
            queue,
            &retry_topology.post_exchange,
            queue,
            Default::default(),
        )
        .await
}

fn panic_to_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    anyhow::anyhow!("Message handler panicked: {}", message)
}
