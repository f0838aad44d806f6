//! Error types.

use thiserror::Error;

use crate::context::ContextState;
use crate::hooks::AsyncId;

/// Failure to obtain the output of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("task {0} was dropped before it completed")]
    Cancelled(AsyncId),
}

/// Failures of the context API outside of a `run`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("no context is active in the current execution window")]
    NoActiveContext,
    #[error("the executor behind this pool has been dropped")]
    ExecutorDropped,
}

/// Outcome of a failed [`Context::run`](crate::Context::run).
#[derive(Debug, Error)]
pub enum RunError<E> {
    /// The body returned this error. It is delivered untouched, after the
    /// context has been destroyed.
    #[error("{0}")]
    Body(E),
    /// The body's task was dropped by the executor before it finished.
    #[error(transparent)]
    Cancelled(#[from] JoinError),
    /// `run` was called on a context that had already been run.
    #[error("context cannot be run from state {0:?}")]
    AlreadyRun(ContextState),
}

impl<E> RunError<E> {
    /// The body's own error, if that is what this is.
    pub fn into_body(self) -> Option<E> {
        match self {
            RunError::Body(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_body(&self) -> bool {
        matches!(self, RunError::Body(_))
    }
}
