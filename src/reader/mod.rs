//! Parallel file processing on top of the worker pool.
//!
//! Roughly equivalent to this serial loop, but spread over the pool's
//! persistent threads:
//!
//! ```text
//! for (userdata, path) in stream {
//!     let t0 = Instant::now();
//!     let file = MappedFile::open(path)?;
//!     callback(&file, userdata, ItemTiming { t0, .. })?;
//! }
//! ```
//!
//! The callback runs concurrently on many threads and must do its own
//! synchronization for anything it shares.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::io::MappedFile;
use crate::parallel::{JobReport, WorkerPool};
use crate::relay::Partition;
use crate::slot_local::SlotLocal;

/// Timing context handed to every callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct ItemTiming {
    /// Taken right before the file was opened.
    pub t0: Instant,
    pub slot: usize,
}

/// Per-slot state kept alive between jobs.
#[derive(Debug)]
pub struct ReadSession {
    slot: usize,
    created: Instant,
    files_opened: usize,
}

impl ReadSession {
    fn new(slot: usize) -> Self {
        debug!(slot, "read session created");
        Self {
            slot,
            created: Instant::now(),
            files_opened: 0,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            slot: self.slot,
            created: self.created,
            files_opened: self.files_opened,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot: usize,
    pub created: Instant,
    pub files_opened: usize,
}

pub type FileCallback<U> = dyn Fn(&MappedFile, U, ItemTiming) -> anyhow::Result<()> + Send + Sync;

struct StreamArgs<U> {
    sessions: Arc<SlotLocal<ReadSession>>,
    callback: Box<FileCallback<U>>,
}

fn process_file_stream<U>(src: Partition<(U, PathBuf)>, args: &StreamArgs<U>) -> anyhow::Result<()> {
    let slot = args.sessions.with(ReadSession::new, |session| session.slot)?;

    for (userdata, path) in src {
        let t0 = Instant::now();
        let file = MappedFile::open(&path)?;
        args.sessions.with(ReadSession::new, |session| session.files_opened += 1)?;
        (args.callback)(&file, userdata, ItemTiming { t0, slot })?;
    }
    Ok(())
}

/// Processes batches of files on a persistent pool.
///
/// Create one per application and reuse it: the first file each thread
/// handles pays the per-thread setup cost.
pub struct ParallelReader {
    pool: WorkerPool,
    sessions: Arc<SlotLocal<ReadSession>>,
}

impl ParallelReader {
    pub fn new(num_workers: usize) -> Result<Self> {
        Ok(Self::with_pool(WorkerPool::new(num_workers)?))
    }

    pub fn with_pool(pool: WorkerPool) -> Self {
        let sessions = Arc::new(SlotLocal::new(&pool));
        Self { pool, sessions }
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Make sure every worker thread is up and holds a session.
    pub fn warmup(&self) -> Result<Vec<SessionInfo>> {
        self.warmup_with(|_| ())
    }

    /// Like [`warmup`](Self::warmup), then runs `action` once in every worker
    /// so callers can set up their own thread-local state.
    pub fn warmup_with<F>(&self, action: F) -> Result<Vec<SessionInfo>>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let sessions = Arc::clone(&self.sessions);
        self.pool
            .broadcast(move |_| -> Result<SessionInfo> {
                let info = sessions.with(ReadSession::new, |session| session.info())?;
                action(info.slot);
                Ok(info)
            })?
            .into_iter()
            .collect()
    }

    /// Open every `(userdata, path)` of `stream` on some worker and hand the
    /// mapped file to `callback`.
    pub fn process<U, S, F>(&self, stream: S, callback: F) -> Result<JobReport>
    where
        U: Send + 'static,
        S: IntoIterator<Item = (U, PathBuf)>,
        F: Fn(&MappedFile, U, ItemTiming) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let args = StreamArgs {
            sessions: Arc::clone(&self.sessions),
            callback: Box::new(callback),
        };
        self.pool.bind(process_file_stream::<U>).run(stream, args)
    }

    pub fn abort(&self) {
        self.pool.abort();
    }

    /// Snapshot of every slot's session, `None` for slots never used.
    pub fn sessions(&self) -> Result<Vec<Option<SessionInfo>>> {
        let sessions = Arc::clone(&self.sessions);
        self.pool
            .broadcast(move |_| sessions.with_existing(|session| session.info()))?
            .into_iter()
            .collect()
    }
}
