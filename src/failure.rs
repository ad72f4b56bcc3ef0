use crate::error::TaskFailure;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Shared record of task failures for one pool.
///
/// The first recorded failure is kept for good; later ones only bump the
/// counter. `observed` is what the admission loop polls for fail-fast mode.
#[derive(Debug)]
pub(crate) struct FailureSlot<E> {
  first: OnceLock<(usize, TaskFailure<E>)>,
  observed: AtomicBool,
  count: AtomicUsize,
}

impl<E> FailureSlot<E> {
  pub(crate) fn new() -> Self {
    Self {
      first: OnceLock::new(),
      observed: AtomicBool::new(false),
      count: AtomicUsize::new(0),
    }
  }

  /// Records a failure for the task at `task_index`.
  ///
  /// Must be called before the task releases its admission permit.
  pub(crate) fn record(&self, task_index: usize, failure: TaskFailure<E>) {
    let total = self.count.fetch_add(1, Ordering::AcqRel) + 1;
    match self.first.set((task_index, failure)) {
      Ok(()) => debug!(%task_index, "Recorded first task failure."),
      Err(_) => warn!(
        %task_index,
        total_failures = total,
        "Additional task failure discarded, first failure is kept."
      ),
    }
    self.observed.store(true, Ordering::Release);
  }

  /// Best-effort: a failure recorded concurrently may not be visible yet.
  pub(crate) fn is_observed(&self) -> bool {
    self.observed.load(Ordering::Acquire)
  }

  pub(crate) fn first(&self) -> Option<&TaskFailure<E>> {
    self.first.get().map(|(_, failure)| failure)
  }

  pub(crate) fn first_index(&self) -> Option<usize> {
    self.first.get().map(|(index, _)| *index)
  }

  pub(crate) fn count(&self) -> usize {
    self.count.load(Ordering::Acquire)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn test_first_failure_wins() {
    let slot = FailureSlot::<&'static str>::new();
    assert!(!slot.is_observed());
    assert!(slot.first().is_none());

    slot.record(4, TaskFailure::Failed("first"));
    slot.record(1, TaskFailure::Failed("second"));
    slot.record(9, TaskFailure::Panicked);

    assert!(slot.is_observed());
    assert_eq!(slot.first(), Some(&TaskFailure::Failed("first")));
    assert_eq!(slot.first_index(), Some(4));
    assert_eq!(slot.count(), 3);
  }

  #[test]
  fn test_concurrent_records_keep_exactly_one() {
    let slot = Arc::new(FailureSlot::<usize>::new());
    let threads: Vec<_> = (0..8)
      .map(|i| {
        let slot = slot.clone();
        std::thread::spawn(move || slot.record(i, TaskFailure::Failed(i)))
      })
      .collect();
    for t in threads {
      t.join().unwrap();
    }

    assert_eq!(slot.count(), 8);
    let index = slot.first_index().unwrap();
    assert_eq!(slot.first(), Some(&TaskFailure::Failed(index)));
  }
}
