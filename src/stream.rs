use fibre::mpsc::UnboundedAsyncReceiver as AsyncReceiver;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::trace;

/// Receive side of a pool execution: yields each successful task value as it
/// completes, in completion order.
///
/// The stream ends once every admitted task has finished. Failures never
/// travel through it; inspect `WorkerPool::err` after the stream has ended.
pub struct ResultStream<T: Send + 'static> {
  pool_name: Arc<String>,
  inner: BoxStream<'static, T>,
  received: usize,
  finished: bool,
}

impl<T: Send + 'static> fmt::Debug for ResultStream<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResultStream")
      .field("pool_name", &self.pool_name)
      .field("received", &self.received)
      .field("finished", &self.finished)
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> ResultStream<T> {
  pub(crate) fn new(pool_name: Arc<String>, rx: AsyncReceiver<T>) -> Self {
    let inner = stream::unfold(rx, |mut rx| async move {
      match rx.recv().await {
        Ok(value) => Some((value, rx)),
        Err(_) => None,
      }
    })
    .boxed();

    Self {
      pool_name,
      inner,
      received: 0,
      finished: false,
    }
  }

  /// Waits for the next successful result. Returns `None` once the stream is
  /// closed and drained.
  pub async fn recv(&mut self) -> Option<T> {
    self.next().await
  }

  /// Drains the stream to completion.
  pub async fn collect_all(mut self) -> Vec<T> {
    let mut values = Vec::new();
    while let Some(value) = self.recv().await {
      values.push(value);
    }
    values
  }

  /// Number of values yielded so far.
  pub fn received(&self) -> usize {
    self.received
  }

  /// `true` once the stream has reported its end.
  pub fn is_finished(&self) -> bool {
    self.finished
  }
}

impl<T: Send + 'static> Stream for ResultStream<T> {
  type Item = T;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
    if self.finished {
      return Poll::Ready(None);
    }
    match self.inner.poll_next_unpin(cx) {
      Poll::Ready(Some(value)) => {
        self.received += 1;
        Poll::Ready(Some(value))
      }
      Poll::Ready(None) => {
        self.finished = true;
        trace!(pool_name = %*self.pool_name, received = self.received, "Result stream closed.");
        Poll::Ready(None)
      }
      Poll::Pending => Poll::Pending,
    }
  }
}
