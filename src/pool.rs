use crate::config::PoolConfig;
use crate::error::{PoolError, TaskFailure};
use crate::failure::FailureSlot;
use crate::stream::ResultStream;
use crate::task::{BoxError, ManagedTaskInternal};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use fibre::mpsc::{self, UnboundedAsyncSender as AsyncSender};
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// A bounded-concurrency executor for a fixed batch of fallible tasks.
///
/// Tasks are registered with [`add`](Self::add) or
/// [`add_blocking`](Self::add_blocking), then started once with
/// [`exec`](Self::exec). At most `concurrency_limit` tasks run at a time and
/// they are admitted in registration order. Successful values arrive on the
/// returned [`ResultStream`] in completion order; failures are kept on the
/// pool and read with [`err`](Self::err).
pub struct WorkerPool<T: Send + 'static, E: Send + Sync + 'static = BoxError> {
  pool_name: Arc<String>,
  concurrency_limit: usize,
  continue_on_failure: bool,
  tokio_handle: Option<TokioHandle>,
  tasks: Vec<ManagedTaskInternal<T, E>>,
  registered: usize,
  started: bool,
  admitted: Arc<AtomicUsize>,
  failures: Arc<FailureSlot<E>>,
}

impl<T: Send + 'static, E: Send + Sync + 'static> std::fmt::Debug for WorkerPool<T, E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("concurrency_limit", &self.concurrency_limit)
      .field("continue_on_failure", &self.continue_on_failure)
      .field("registered", &self.registered)
      .field("started", &self.started)
      .field("admitted", &self.admitted_count())
      .field("failures", &self.failure_count())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static, E: Send + Sync + 'static> WorkerPool<T, E> {
  /// Creates an empty pool.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidConcurrencyLimit` if `concurrency_limit` is 0
  /// or exceeds `Semaphore::MAX_PERMITS`.
  pub fn new(concurrency_limit: usize, continue_on_failure: bool) -> Result<Self, PoolError> {
    Self::with_config(PoolConfig::new(concurrency_limit, continue_on_failure))
  }

  pub fn with_config(mut config: PoolConfig) -> Result<Self, PoolError> {
    if config.concurrency_limit == 0 || config.concurrency_limit > Semaphore::MAX_PERMITS {
      return Err(PoolError::InvalidConcurrencyLimit {
        limit: config.concurrency_limit,
        max: Semaphore::MAX_PERMITS,
      });
    }
    let pool_name = config.resolve_pool_name();
    debug!(
      %pool_name,
      concurrency_limit = config.concurrency_limit,
      continue_on_failure = config.continue_on_failure,
      "Created worker pool."
    );

    Ok(Self {
      pool_name: Arc::new(pool_name),
      concurrency_limit: config.concurrency_limit,
      continue_on_failure: config.continue_on_failure,
      tokio_handle: config.tokio_handle,
      tasks: Vec::new(),
      registered: 0,
      started: false,
      admitted: Arc::new(AtomicUsize::new(0)),
      failures: Arc::new(FailureSlot::new()),
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn concurrency_limit(&self) -> usize {
    self.concurrency_limit
  }

  pub fn continue_on_failure(&self) -> bool {
    self.continue_on_failure
  }

  /// Number of registered tasks.
  pub fn len(&self) -> usize {
    self.registered
  }

  pub fn is_empty(&self) -> bool {
    self.registered == 0
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  /// Number of tasks launched so far. Lower than `len()` after a fail-fast stop.
  pub fn admitted_count(&self) -> usize {
    self.admitted.load(AtomicOrdering::Acquire)
  }

  /// Number of tasks that have failed so far, panics included.
  pub fn failure_count(&self) -> usize {
    self.failures.count()
  }

  /// Registers an async task and returns its registration index.
  ///
  /// `producer` is not invoked until the task is admitted.
  ///
  /// # Errors
  /// Returns `PoolError::AlreadyStarted` once `exec` has been called.
  pub fn add<F, Fut>(&mut self, producer: F) -> Result<usize, PoolError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let task_index = self.next_task_index()?;
    self.tasks.push(ManagedTaskInternal::from_async(task_index, producer));
    Ok(task_index)
  }

  /// Registers a synchronous task, run on Tokio's blocking thread pool.
  ///
  /// It holds a concurrency slot for as long as it runs, like any other task.
  pub fn add_blocking<F>(&mut self, producer: F) -> Result<usize, PoolError>
  where
    F: FnOnce() -> Result<T, E> + Send + 'static,
  {
    let task_index = self.next_task_index()?;
    self.tasks.push(ManagedTaskInternal::from_blocking(task_index, producer));
    Ok(task_index)
  }

  fn next_task_index(&mut self) -> Result<usize, PoolError> {
    if self.started {
      warn!(pool_name = %self.pool_name, "Add: Attempted to register a task after execution started.");
      return Err(PoolError::AlreadyStarted);
    }
    let task_index = self.registered;
    self.registered += 1;
    trace!(pool_name = %self.pool_name, %task_index, "Registered task.");
    Ok(task_index)
  }

  /// Starts executing every registered task and returns the result stream.
  ///
  /// Returns immediately; admission happens on the runtime. With no
  /// registered tasks the stream is already closed and no runtime is needed.
  ///
  /// # Errors
  /// Returns `PoolError::AlreadyExecuted` on a second call and
  /// `PoolError::NoRuntime` if tasks are registered but neither a configured
  /// nor an ambient Tokio runtime is available.
  pub fn exec(&mut self) -> Result<ResultStream<T>, PoolError> {
    if self.started {
      warn!(pool_name = %self.pool_name, "Exec: Pool was already executed.");
      return Err(PoolError::AlreadyExecuted);
    }

    let (mut result_tx, result_rx) = mpsc::unbounded_async::<T>();
    let results = ResultStream::new(self.pool_name.clone(), result_rx);

    if self.tasks.is_empty() {
      self.started = true;
      let _ = result_tx.close();
      info!(pool_name = %self.pool_name, "Exec: No tasks registered, result stream closed immediately.");
      return Ok(results);
    }

    let tokio_handle = match self.tokio_handle.clone() {
      Some(handle) => handle,
      None => TokioHandle::try_current().map_err(|_| {
        error!(pool_name = %self.pool_name, "Exec: No Tokio runtime available.");
        PoolError::NoRuntime
      })?,
    };
    self.started = true;

    let tasks = std::mem::take(&mut self.tasks);
    info!(
      pool_name = %self.pool_name,
      task_count = tasks.len(),
      concurrency_limit = self.concurrency_limit,
      continue_on_failure = self.continue_on_failure,
      "Exec: Starting pool execution."
    );

    let tracker = TaskTracker::new();
    let admission = AdmissionLoop {
      pool_name: self.pool_name.clone(),
      semaphore: Arc::new(Semaphore::new(self.concurrency_limit)),
      tracker: tracker.clone(),
      tokio_handle: tokio_handle.clone(),
      failures: self.failures.clone(),
      admitted: self.admitted.clone(),
      continue_on_failure: self.continue_on_failure,
      result_tx: result_tx.clone(),
    };

    tokio_handle.spawn(
      admission
        .run(tasks)
        .instrument(info_span!("worker_pool_admission", pool_name = %*self.pool_name)),
    );

    let watcher_pool_name = self.pool_name.clone();
    let watcher_failures = self.failures.clone();
    tokio_handle.spawn(
      async move {
        tracker.wait().await;
        let _ = result_tx.close();
        info!(
          pool_name = %*watcher_pool_name,
          failures = watcher_failures.count(),
          "All admitted tasks finished. Result stream closed."
        );
      }
      .instrument(info_span!("worker_pool_completion_watcher", pool_name = %*self.pool_name)),
    );

    Ok(results)
  }

  /// Returns the first recorded task failure, if any.
  ///
  /// Only final once the `ResultStream` from `exec` has been fully drained;
  /// before that, running tasks may still fail. After that point repeated
  /// calls always return the same value.
  pub fn err(&self) -> Option<&TaskFailure<E>> {
    self.failures.first()
  }

  /// Registration index of the task behind [`err`](Self::err).
  pub fn err_task_index(&self) -> Option<usize> {
    self.failures.first_index()
  }
}

/// State moved into the spawned admission loop.
struct AdmissionLoop<T: Send + 'static, E: Send + Sync + 'static> {
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  tracker: TaskTracker,
  tokio_handle: TokioHandle,
  failures: Arc<FailureSlot<E>>,
  admitted: Arc<AtomicUsize>,
  continue_on_failure: bool,
  result_tx: AsyncSender<T>,
}

impl<T: Send + 'static, E: Send + Sync + 'static> AdmissionLoop<T, E> {
  fn should_stop(&self) -> bool {
    !self.continue_on_failure && self.failures.is_observed()
  }

  async fn run(self, tasks: Vec<ManagedTaskInternal<T, E>>) {
    let total = tasks.len();
    info!(name = %*self.pool_name, %total, "Admission loop started.");

    for managed_task in tasks {
      let task_index = managed_task.task_index;

      if self.should_stop() {
        info!(
          name = %*self.pool_name,
          %task_index,
          "Failure observed, not admitting remaining tasks."
        );
        break;
      }

      let permit = match self.semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
          error!(name = %*self.pool_name, "Semaphore closed. Admission loop exiting.");
          break;
        }
      };
      trace!(
        name = %*self.pool_name,
        %task_index,
        "Acquired permit. Available: {}",
        self.semaphore.available_permits()
      );

      // A slot freed by a failing task is released only after that failure was recorded.
      if self.should_stop() {
        info!(
          name = %*self.pool_name,
          %task_index,
          "Failure observed while waiting for a slot, not admitting remaining tasks."
        );
        drop(permit);
        break;
      }

      let task_future = managed_task.into_future();
      let task_pool_name = self.pool_name.clone();
      let settlement = TaskSettlement {
        pool_name: self.pool_name.clone(),
        task_index,
        failures: self.failures.clone(),
        result_tx: self.result_tx.clone(),
        _permit: permit,
        settled: false,
      };

      self.admitted.fetch_add(1, AtomicOrdering::AcqRel);
      debug!(name = %*self.pool_name, %task_index, "Admitting task.");

      self.tracker.spawn_on(
        async move {
          match AssertUnwindSafe(task_future).catch_unwind().await {
            Ok(Ok(value)) => {
              trace!(pool_name = %*task_pool_name, %task_index, "Task executed successfully.");
              settlement.deliver(value).await;
            }
            Ok(Err(failure)) => {
              warn!(pool_name = %*task_pool_name, %task_index, "Task failed.");
              settlement.fail(failure);
            }
            Err(panic_payload) => {
              error!(
                pool_name = %*task_pool_name,
                %task_index,
                panic = %panic_message(&*panic_payload),
                "Task panicked during execution."
              );
              settlement.fail(TaskFailure::Panicked);
            }
          }
        }
        .instrument(info_span!("pool_task", pool_name = %*self.pool_name, %task_index)),
        &self.tokio_handle,
      );
    }

    let admitted = self.admitted.load(AtomicOrdering::Acquire);
    drop(self.result_tx);
    self.tracker.close();
    info!(
      name = %*self.pool_name,
      %admitted,
      skipped = total - admitted,
      "Admission loop finished."
    );
  }
}

/// Everything an admitted task holds until its outcome is recorded.
///
/// Dropping it unsettled (the task future was dropped mid-flight, e.g. by a
/// runtime shutdown) records `TaskFailure::Aborted`. `Drop` runs before the
/// fields are released, so the failure is visible before the permit frees a
/// slot and before this task's sender stops keeping the result stream open.
struct TaskSettlement<T: Send + 'static, E: Send + Sync + 'static> {
  pool_name: Arc<String>,
  task_index: usize,
  failures: Arc<FailureSlot<E>>,
  result_tx: AsyncSender<T>,
  _permit: OwnedSemaphorePermit,
  settled: bool,
}

impl<T: Send + 'static, E: Send + Sync + 'static> TaskSettlement<T, E> {
  async fn deliver(mut self, value: T) {
    if self.result_tx.send(value).await.is_err() {
      trace!(
        pool_name = %*self.pool_name,
        task_index = self.task_index,
        "Result stream was dropped. Task value discarded."
      );
    }
    self.settled = true;
  }

  fn fail(mut self, failure: TaskFailure<E>) {
    self.failures.record(self.task_index, failure);
    self.settled = true;
  }
}

impl<T: Send + 'static, E: Send + Sync + 'static> Drop for TaskSettlement<T, E> {
  fn drop(&mut self) {
    if !self.settled {
      warn!(
        pool_name = %*self.pool_name,
        task_index = self.task_index,
        "Task dropped before completing. Recording it as aborted."
      );
      self.failures.record(self.task_index, TaskFailure::Aborted);
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  payload
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("<non-string panic payload>")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_panic_message_extracts_string_payloads() {
    let static_payload: Box<dyn Any + Send> = Box::new("static message");
    assert_eq!(panic_message(&*static_payload), "static message");

    let owned_payload: Box<dyn Any + Send> = Box::new(format!("task {} exploded", 3));
    assert_eq!(panic_message(&*owned_payload), "task 3 exploded");

    let other_payload: Box<dyn Any + Send> = Box::new(17u32);
    assert_eq!(panic_message(&*other_payload), "<non-string panic payload>");
  }

  #[test]
  fn test_rejects_zero_concurrency_limit() {
    let result = WorkerPool::<u32>::new(0, false);
    assert_eq!(
      result.unwrap_err(),
      PoolError::InvalidConcurrencyLimit {
        limit: 0,
        max: Semaphore::MAX_PERMITS
      }
    );
  }

  #[test]
  fn test_rejects_limit_above_semaphore_max() {
    let result = WorkerPool::<u32>::new(Semaphore::MAX_PERMITS + 1, true);
    assert!(matches!(result, Err(PoolError::InvalidConcurrencyLimit { .. })));
  }

  #[test]
  fn test_registration_indices_are_sequential() {
    let mut pool = WorkerPool::<u32, String>::new(2, false).unwrap();
    assert!(pool.is_empty());
    assert_eq!(pool.add(|| async { Ok(1) }).unwrap(), 0);
    assert_eq!(pool.add_blocking(|| Ok(2)).unwrap(), 1);
    assert_eq!(pool.add(|| async { Ok(3) }).unwrap(), 2);
    assert_eq!(pool.len(), 3);
    assert!(!pool.is_started());
  }

  #[test]
  fn test_empty_exec_needs_no_runtime() {
    let mut pool = WorkerPool::<u32, String>::new(1, false).unwrap();
    let results = pool.exec().unwrap();
    assert!(pool.is_started());
    assert!(pool.err().is_none());
    drop(results);
  }

  #[test]
  fn test_exec_without_runtime_fails_and_stays_usable() {
    let mut pool = WorkerPool::<u32, String>::new(1, false).unwrap();
    pool.add(|| async { Ok(1) }).unwrap();
    assert_eq!(pool.exec().unwrap_err(), PoolError::NoRuntime);
    assert!(!pool.is_started());
    assert_eq!(pool.len(), 1);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let values = runtime.block_on(async { pool.exec().unwrap().collect_all().await });
    assert_eq!(values, vec![1]);
  }

  #[test]
  fn test_configured_handle_is_used_outside_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let config = PoolConfig::new(2, false)
      .with_pool_name("handle_pool")
      .with_tokio_handle(runtime.handle().clone());
    let mut pool = WorkerPool::<u32, String>::with_config(config).unwrap();
    assert_eq!(pool.name(), "handle_pool");
    for i in 0..4 {
      pool.add(move || async move { Ok(i) }).unwrap();
    }

    // exec is called outside any runtime context.
    let results = pool.exec().unwrap();
    let mut values = runtime.block_on(results.collect_all());
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2, 3]);
    assert_eq!(pool.admitted_count(), 4);
  }
}
