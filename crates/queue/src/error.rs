//! Queue error types.

use relay_common::AppError;
use thiserror::Error;

use crate::handler::HandlerError;

/// Queue result type.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by the registry and dispatcher.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed or duplicate queue definition.
    #[error("invalid queue configuration: {0}")]
    Config(String),

    /// Submission named a queue that is not registered.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// No live task has this ID.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The dispatcher is shutting down and accepts no new work.
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    /// An inline execution failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Config(msg) => Self::Config(msg),
            QueueError::UnknownQueue(name) => Self::UnknownQueue(name),
            QueueError::TaskNotFound(id) => Self::NotFound(format!("task {id}")),
            QueueError::ShuttingDown => Self::Conflict("dispatcher is shutting down".into()),
            QueueError::Handler(e) => Self::Handler(e.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for QueueError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}
