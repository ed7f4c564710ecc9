//! Saga error types.

use stayflow_core::channel::ChannelError;
use thiserror::Error;

/// Errors raised while building a [`DispatchTable`](crate::dispatch::DispatchTable).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A discriminant the service must handle has no handler
    #[error("No handler registered for required message type {0}")]
    MissingHandler(String),

    /// Two handlers were registered for one discriminant
    #[error("Handler registered twice for message type {0}")]
    DuplicateHandler(String),
}

/// Errors raised by the saga orchestrator and its participants.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    /// Publishing or subscribing failed
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A dispatch table was incomplete
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A repository call failed
    #[error("Repository error: {0}")]
    Repository(String),

    /// The saga state machine stopped accepting actions or did not answer in time
    #[error("Saga runtime error: {0}")]
    Runtime(#[from] stayflow_runtime::StoreError),
}

/// Result alias for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;
