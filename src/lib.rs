//! A Tokio-based bounded-concurrency executor: register a batch of fallible
//! tasks, run at most N of them at once, and stream their successful results
//! back as they complete.
//!
//! ```no_run
//! # async fn run() -> Result<(), futures_fanout::PoolError> {
//! use futures_fanout::WorkerPool;
//!
//! let mut pool = WorkerPool::<u64, std::io::Error>::new(5, false)?;
//! for _ in 0..100 {
//!   pool.add(|| async { Ok(1) })?;
//! }
//! let total: u64 = pool.exec()?.collect_all().await.into_iter().sum();
//! assert_eq!(total, 100);
//! assert!(pool.err().is_none());
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod failure;
mod pool;
mod stream;
mod task;

pub use config::PoolConfig;
pub use error::{PoolError, TaskFailure};
pub use pool::WorkerPool;
pub use stream::ResultStream;
pub use task::{BoxError, TaskToExecute};
