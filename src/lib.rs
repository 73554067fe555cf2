//! # pstream
//!
//! Persistent parallel stream processing: a fixed pool of long-lived worker
//! threads that repeatedly drains sequential streams of work items, keeping
//! per-thread state alive between jobs.
//!
//! ```no_run
//! use pstream::{Partition, WorkerPool};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = WorkerPool::new(4)?;
//! let run = pool.bind(|items: Partition<usize>, total: &Arc<AtomicUsize>| {
//!     for item in items {
//!         total.fetch_add(item, Ordering::Relaxed);
//!     }
//!     Ok(())
//! });
//!
//! let sum = Arc::new(AtomicUsize::new(0));
//! run.run(0..100, Arc::clone(&sum))?;
//! run.run(100..200, Arc::clone(&sum))?;
//! assert_eq!(sum.load(Ordering::Relaxed), (0..200usize).sum::<usize>());
//! # Ok::<(), pstream::Error>(())
//! ```

pub mod blocks;
pub mod error;
pub mod io;
pub mod parallel;
pub mod reader;
pub mod relay;
pub mod slot_local;

pub use error::{Error, Result};
pub use parallel::{BindOptions, BoundRunner, JobReport, WorkerPool};
pub use relay::{AbortHandle, Partition, RunState};
pub use slot_local::SlotLocal;
