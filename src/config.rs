use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::runtime::Handle as TokioHandle;

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Construction-time settings of a `WorkerPool`. Fixed once the pool exists.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Maximum number of tasks running at the same time. Must be at least 1.
  pub concurrency_limit: usize,
  /// When `false`, no further tasks are admitted once a failure was observed.
  pub continue_on_failure: bool,
  /// Name used in log spans. A unique `worker_pool_<n>` is generated if unset.
  pub pool_name: Option<String>,
  /// Runtime to spawn on. Falls back to the ambient runtime at `exec` time.
  pub tokio_handle: Option<TokioHandle>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      concurrency_limit: 1,
      continue_on_failure: false,
      pool_name: None,
      tokio_handle: None,
    }
  }
}

impl PoolConfig {
  pub fn new(concurrency_limit: usize, continue_on_failure: bool) -> Self {
    Self {
      concurrency_limit,
      continue_on_failure,
      ..Self::default()
    }
  }

  pub fn with_concurrency_limit(mut self, concurrency_limit: usize) -> Self {
    self.concurrency_limit = concurrency_limit;
    self
  }

  pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
    self.continue_on_failure = continue_on_failure;
    self
  }

  pub fn with_pool_name(mut self, pool_name: impl Into<String>) -> Self {
    self.pool_name = Some(pool_name.into());
    self
  }

  pub fn with_tokio_handle(mut self, tokio_handle: TokioHandle) -> Self {
    self.tokio_handle = Some(tokio_handle);
    self
  }

  pub(crate) fn resolve_pool_name(&mut self) -> String {
    self.pool_name.take().unwrap_or_else(|| {
      let id = NEXT_POOL_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
      format!("worker_pool_{}", id)
    })
  }
}
