//! The `MessageHandler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::Message;
use std::future::Future;

/// Implementers of the `MessageHandler` trait process the messages pushed to a
/// [`Consumer`](crate::consumers::Consumer).
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The outcome of processing is passed to the consumer's
/// [`ResultHandler`](crate::consumers::ResultHandler), which takes care of acking, rejecting or
/// retrying the message with the broker.
/// This decouples the low-level interactions with the message broker and the retry logic from
/// the actual business logic associated with the processing of a message.
///
/// Panics are caught and treated as errors.
///
/// # Implementers
///
/// While you can implement `MessageHandler` for a struct or enum, most of the time you will be
/// relying on [`ClosureHandler`], which wraps async functions with a matching signature -
/// `Fn(Message) -> Fut`.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Box<H> {
    async fn handle(&self, message: &Message) -> Result<(), anyhow::Error> {
        (**self).handle(message).await
    }
}

/// Adapts an async closure into a [`MessageHandler`].
///
/// ```rust
/// use carrot_lifeline::consumers::{ClosureHandler, Message};
///
/// let handler = ClosureHandler(|message: Message| async move {
///     println!("{}", message.content_str());
///     Ok::<(), std::io::Error>(())
/// });
/// ```
#[derive(Clone)]
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> MessageHandler for ClosureHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn handle(&self, message: &Message) -> Result<(), anyhow::Error> {
        (self.0)(message.clone()).await.map_err(Into::into)
    }
}
