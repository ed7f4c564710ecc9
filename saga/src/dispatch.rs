//! Typed dispatch from message discriminants to async handlers.
//!
//! Each saga service registers one handler per message type it understands and
//! validates the table when it starts, so a missing handler is a start-up error
//! rather than a silently dropped message at runtime.
//!
//! ```ignore
//! let table = DispatchTable::builder()
//!     .on(CommandType::CreateAvailability, move |command| participant.handle(command))
//!     .fallback(move |command| participant.reply_unknown(command))
//!     .build(&[CommandType::CreateAvailability])?;
//!
//! let messages = channel.subscribe("create-accommodation.command", "reservations-service").await?;
//! tokio::spawn(serve(messages, Arc::new(table), shutdown));
//! ```

use crate::error::{DispatchError, Result};
use crate::messages::{Command, CommandType, Reply, ReplyType};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use stayflow_core::channel::MessageStream;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

/// A message that names its own type.
pub trait Discriminant<K> {
    /// The discriminant the table dispatches on.
    fn discriminant(&self) -> K;
}

impl Discriminant<CommandType> for Command {
    fn discriminant(&self) -> CommandType {
        self.kind
    }
}

impl Discriminant<ReplyType> for Reply {
    fn discriminant(&self) -> ReplyType {
        self.kind
    }
}

/// Boxed async handler for one message.
pub type Handler<M> =
    Arc<dyn Fn(M) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

fn boxed<M, F, Fut>(handler: F) -> Handler<M>
where
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(handler(message)))
}

/// Collects handlers before validation.
pub struct DispatchTableBuilder<K, M> {
    handlers: Vec<(K, Handler<M>)>,
    fallback: Option<Handler<M>>,
}

impl<K, M> DispatchTableBuilder<K, M>
where
    K: Copy + Eq + Hash + Debug,
{
    /// Handle messages of type `kind` with `handler`.
    #[must_use]
    pub fn on<F, Fut>(mut self, kind: K, handler: F) -> Self
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.push((kind, boxed(handler)));
        self
    }

    /// Handle every message type without its own handler.
    #[must_use]
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.fallback = Some(boxed(handler));
        self
    }

    /// Validate and freeze the table.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::DuplicateHandler`]: a type was registered twice
    /// - [`DispatchError::MissingHandler`]: a type in `required` has no handler of its own
    pub fn build(self, required: &[K]) -> std::result::Result<DispatchTable<K, M>, DispatchError> {
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (kind, handler) in self.handlers {
            if handlers.insert(kind, handler).is_some() {
                return Err(DispatchError::DuplicateHandler(format!("{kind:?}")));
            }
        }

        if let Some(missing) = required.iter().find(|kind| !handlers.contains_key(*kind)) {
            return Err(DispatchError::MissingHandler(format!("{missing:?}")));
        }

        Ok(DispatchTable {
            handlers,
            fallback: self.fallback,
        })
    }
}

/// Validated mapping from discriminant to handler.
pub struct DispatchTable<K, M> {
    handlers: HashMap<K, Handler<M>>,
    fallback: Option<Handler<M>>,
}

impl<K, M> DispatchTable<K, M>
where
    K: Copy + Eq + Hash + Debug,
    M: Discriminant<K>,
{
    /// Start building a table.
    #[must_use]
    pub fn builder() -> DispatchTableBuilder<K, M> {
        DispatchTableBuilder {
            handlers: Vec::new(),
            fallback: None,
        }
    }

    /// Whether `kind` has a handler of its own.
    #[must_use]
    pub fn handles(&self, kind: K) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run the handler for `message`.
    ///
    /// Messages without a handler go to the fallback, or are logged and dropped when
    /// there is none.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returns.
    pub async fn dispatch(&self, message: M) -> Result<()> {
        let kind = message.discriminant();
        match self.handlers.get(&kind).or(self.fallback.as_ref()) {
            Some(handler) => handler(message).await,
            None => {
                tracing::warn!(?kind, "No handler for message type, skipping");
                metrics::counter!("saga.messages.unhandled").increment(1);
                Ok(())
            },
        }
    }
}

/// Feed a subscription through `table` until shutdown or the stream ends.
///
/// Messages are handled one at a time in arrival order. A message is acked once its
/// handler returns Ok and nacked when the handler fails, so the bus delivers it again.
/// Payloads that do not decode are logged and acked; nothing stops the loop.
pub async fn serve<K, M>(
    mut messages: MessageStream,
    table: Arc<DispatchTable<K, M>>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Copy + Eq + Hash + Debug,
    M: Discriminant<K> + DeserializeOwned,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            next = messages.next() => next,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            },
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(error)) => {
                tracing::error!(error = %error, "Subscription error");
                continue;
            },
            None => {
                tracing::warn!("Subscription ended");
                break;
            },
        };

        let decoded = match message.decode::<M>() {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(
                    subject = %message.subject,
                    error = %error,
                    "Dropping message that does not decode"
                );
                message.ack();
                metrics::counter!("saga.messages.undecodable", "subject" => message.subject)
                    .increment(1);
                continue;
            },
        };

        let kind = decoded.discriminant();
        tracing::debug!(subject = %message.subject, ?kind, "Dispatching message");
        match table.dispatch(decoded).await {
            Ok(()) => message.ack(),
            Err(error) => {
                tracing::error!(subject = %message.subject, ?kind, error = %error, "Handler failed");
                message.nack();
                metrics::counter!("saga.handler.failures", "subject" => message.subject)
                    .increment(1);
            },
        }
    }
}
