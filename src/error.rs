use thiserror::Error;

/// Usage and environment errors raised by a `WorkerPool`.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Concurrency limit must be between 1 and {max}, got {limit}")]
  InvalidConcurrencyLimit { limit: usize, max: usize },

  #[error("Pool execution has already started, cannot register new tasks")]
  AlreadyStarted,

  #[error("Pool has already been executed, it cannot be executed again")]
  AlreadyExecuted,

  #[error("No Tokio runtime configured or available to execute the pool's tasks")]
  NoRuntime,
}

impl PoolError {
  /// Returns `true` for precondition violations by the caller, as opposed to
  /// a missing runtime.
  pub fn is_invalid_usage(&self) -> bool {
    matches!(
      self,
      PoolError::InvalidConcurrencyLimit { .. } | PoolError::AlreadyStarted | PoolError::AlreadyExecuted
    )
  }
}

/// The failure recorded for a task that did not produce a value.
#[derive(Error, Debug, PartialEq)]
pub enum TaskFailure<E> {
  #[error("Task failed: {0}")]
  Failed(E),

  #[error("Task panicked during execution")]
  Panicked,

  #[error("Task was dropped before completing (runtime shutting down)")]
  Aborted,
}

impl<E> TaskFailure<E> {
  /// Returns the task's own error, if the failure came from one.
  pub fn as_inner(&self) -> Option<&E> {
    match self {
      TaskFailure::Failed(e) => Some(e),
      _ => None,
    }
  }

  pub fn into_inner(self) -> Option<E> {
    match self {
      TaskFailure::Failed(e) => Some(e),
      _ => None,
    }
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, TaskFailure::Panicked)
  }
}
