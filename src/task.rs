use crate::error::TaskFailure;

use std::future::Future;
use std::pin::Pin;

/// Boxed error type used when a pool is declared without an explicit error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The type of future a registered producer resolves to.
pub type TaskToExecute<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// Future actually driven by the pool once a task has been admitted.
pub(crate) type ManagedFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, TaskFailure<E>>> + Send + 'static>>;

/// Internal representation of a registered, not yet admitted task.
pub(crate) struct ManagedTaskInternal<T, E> {
  pub(crate) task_index: usize,
  producer: Box<dyn FnOnce() -> ManagedFuture<T, E> + Send + 'static>,
}

impl<T: Send + 'static, E: Send + 'static> ManagedTaskInternal<T, E> {
  pub(crate) fn from_async<F, Fut>(task_index: usize, producer: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    Self {
      task_index,
      producer: Box::new(move || -> ManagedFuture<T, E> {
        Box::pin(async move { producer().await.map_err(TaskFailure::Failed) })
      }),
    }
  }

  pub(crate) fn from_blocking<F>(task_index: usize, producer: F) -> Self
  where
    F: FnOnce() -> Result<T, E> + Send + 'static,
  {
    Self {
      task_index,
      producer: Box::new(move || -> ManagedFuture<T, E> {
        Box::pin(async move {
          match tokio::task::spawn_blocking(producer).await {
            Ok(outcome) => outcome.map_err(TaskFailure::Failed),
            // Re-raise so the caller's catch_unwind records it as a panic.
            Err(join_error) if join_error.is_panic() => std::panic::resume_unwind(join_error.into_panic()),
            Err(_) => Err(TaskFailure::Aborted),
          }
        })
      }),
    }
  }

  /// Consumes the task, invoking its producer. Nothing runs until the returned
  /// future is polled.
  pub(crate) fn into_future(self) -> ManagedFuture<T, E> {
    let producer = self.producer;
    Box::pin(async move { producer().await })
  }
}
