//! Error types for the stream-processing engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("can not run concurrent jobs on the same worker pool")]
    ConcurrentJob,

    #[error("only have {available} worker threads, but asked for {requested}")]
    InvalidWorkerCount { requested: usize, available: usize },

    #[error("worker pool needs at least one worker thread")]
    InvalidPoolSize,

    #[error("relay needs at least one partition")]
    ZeroPartitions,

    #[error("relay queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("worker slot {slot} failed: {source}")]
    Worker {
        slot: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to build worker thread: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),

    #[error("slot storage accessed outside of its worker pool")]
    SlotUnavailable,

    #[error("slot {slot} storage is already in use further up this thread's stack")]
    SlotBusy { slot: usize },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Slot index of a failed worker, if this error came from one.
    pub fn slot(&self) -> Option<usize> {
        match self {
            Error::Worker { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}
