//! Persistent worker pool that runs stream processors over a relay.
//!
//! Every slot is a dedicated single-thread rayon pool that lives as long as
//! the [`WorkerPool`], so anything a processor leaves in thread-local storage
//! (sessions, caches, scratch buffers) survives from one job to the next.

use anyhow::anyhow;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::relay::{
    self, AbortHandle, Partition, RunState, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_CAPACITY,
};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_SLOT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Slot index of the calling thread within the pool identified by `pool_id`.
pub(crate) fn slot_in(pool_id: usize) -> Option<usize> {
    CURRENT_SLOT
        .with(Cell::get)
        .and_then(|(pool, slot)| (pool == pool_id).then_some(slot))
}

/// Worker count used when none is given.
pub fn default_num_workers() -> usize {
    let cpus = num_cpus::get();
    cpus.min(8) // Cap at 8 workers for (probably) diminishing returns
}

pub type StreamProc<T, A> = dyn Fn(Partition<T>, &A) -> anyhow::Result<()> + Send + Sync;
pub type BlockedHook = dyn Fn(&RunState) + Send + Sync;

struct Slot {
    index: usize,
    thread: rayon::ThreadPool,
}

struct Inner {
    id: usize,
    slots: Vec<Slot>,
    job: Mutex<Option<Arc<RunState>>>,
}

/// Fixed set of persistent worker slots. Cloning shares the same slots.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.inner.id)
            .field("num_workers", &self.num_workers())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(Error::InvalidPoolSize);
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let slots = (0..num_workers)
            .map(|index| -> Result<Slot> {
                let thread = rayon::ThreadPoolBuilder::new()
                    .num_threads(1)
                    .thread_name(move |_| format!("pstream-slot-{index}"))
                    .start_handler(move |_| CURRENT_SLOT.with(|c| c.set(Some((id, index)))))
                    .build()?;
                Ok(Slot { index, thread })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(pool = id, num_workers, "worker pool started");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                slots,
                job: Mutex::new(None),
            }),
        })
    }

    pub fn with_default_size() -> Result<Self> {
        Self::new(default_num_workers())
    }

    pub fn num_workers(&self) -> usize {
        self.inner.slots.len()
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }

    /// Slot index of the calling thread, if it is one of this pool's workers.
    pub fn current_slot(&self) -> Option<usize> {
        slot_in(self.inner.id)
    }

    /// Whether a job or broadcast is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.job.lock().is_some()
    }

    /// Abort the active job, if any.
    pub fn abort(&self) {
        if let Some(state) = self.inner.job.lock().as_ref() {
            debug!(pool = self.inner.id, "abort requested");
            state.abort();
        }
    }

    /// Handle on the active job's abort flag.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.inner
            .job
            .lock()
            .as_ref()
            .map(|state| AbortHandle::new(Arc::clone(state)))
    }

    /// Run `callback` once on every slot and return the results in slot order.
    ///
    /// Rejected with [`Error::ConcurrentJob`] while a job is running.
    pub fn broadcast<R, F>(&self, callback: F) -> Result<Vec<R>>
    where
        F: Fn(usize) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let state = Arc::new(RunState::new(0));
        let _job = self.begin_job(Arc::clone(&state))?;
        let callback = Arc::new(callback);
        let tasks: Vec<_> = self
            .inner
            .slots
            .iter()
            .map(|slot| {
                let callback = Arc::clone(&callback);
                let index = slot.index;
                move || -> anyhow::Result<R> { Ok(callback(index)) }
            })
            .collect();

        debug!(pool = self.inner.id, "broadcast");
        self.dispatch(state, tasks).settle()
    }

    pub fn bind<T, A, F>(&self, stream_proc: F) -> BoundRunner<T, A>
    where
        F: Fn(Partition<T>, &A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bind_with(stream_proc, BindOptions::default())
    }

    /// Adapt `stream_proc` into a reusable runner over this pool.
    pub fn bind_with<T, A, F>(&self, stream_proc: F, options: BindOptions) -> BoundRunner<T, A>
    where
        F: Fn(Partition<T>, &A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        BoundRunner {
            pool: self.clone(),
            stream_proc: Arc::new(stream_proc),
            options,
        }
    }

    fn begin_job(&self, state: Arc<RunState>) -> Result<JobGuard<'_>> {
        let mut job = self.inner.job.lock();
        if job.is_some() {
            return Err(Error::ConcurrentJob);
        }
        *job = Some(state);
        Ok(JobGuard { inner: &self.inner })
    }

    /// Submit one task per slot, starting from slot 0.
    fn dispatch<R, F>(&self, state: Arc<RunState>, tasks: Vec<F>) -> InFlight<R>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let count = tasks.len();
        let (tx, rx) = crossbeam_channel::bounded(count);
        for (slot, task) in self.inner.slots.iter().zip(tasks) {
            let tx = tx.clone();
            let index = slot.index;
            slot.thread.spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                    .unwrap_or_else(|payload| Err(anyhow!("worker panicked: {}", panic_message(&payload))));
                let _ = tx.send((index, outcome));
            });
        }
        InFlight {
            state,
            outcomes: Some(rx),
            count,
        }
    }
}

/// Clears the pool's run state however the job ends.
struct JobGuard<'a> {
    inner: &'a Inner,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.inner.job.lock().take();
    }
}

/// Tasks submitted for one job.
///
/// Dropping it unsettled (the caller unwound mid-job) aborts the run and
/// waits for every task. Bind it after the [`JobGuard`] so it drops first and
/// the pool stays busy until its slots are idle.
struct InFlight<R> {
    state: Arc<RunState>,
    outcomes: Option<Receiver<(usize, anyhow::Result<R>)>>,
    count: usize,
}

impl<R> InFlight<R> {
    fn settle(mut self) -> Result<Vec<R>> {
        match self.outcomes.take() {
            Some(outcomes) => settle(outcomes, self.count),
            None => Ok(Vec::new()),
        }
    }
}

impl<R> Drop for InFlight<R> {
    fn drop(&mut self) {
        if let Some(outcomes) = self.outcomes.take() {
            warn!(tasks = self.count, "job unwound, waiting for worker tasks");
            self.state.abort();
            outcomes.iter().take(self.count).for_each(drop);
        }
    }
}

/// Wait for all `count` tasks, then report the first failure observed.
fn settle<R>(outcomes: Receiver<(usize, anyhow::Result<R>)>, count: usize) -> Result<Vec<R>> {
    let mut results: Vec<Option<R>> = (0..count).map(|_| None).collect();
    let mut failure = None;

    for (slot, outcome) in outcomes.iter().take(count) {
        match outcome {
            Ok(value) => results[slot] = Some(value),
            Err(source) => {
                warn!(slot, error = %source, "worker task failed");
                if failure.is_none() {
                    failure = Some(Error::Worker { slot, source });
                }
            }
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }
    debug_assert!(results.iter().all(Option::is_some));
    Ok(results.into_iter().flatten().collect())
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Settings captured when a stream processor is bound.
#[derive(Clone)]
pub struct BindOptions {
    max_workers: Option<usize>,
    queue_capacity: usize,
    poll_interval: Duration,
    on_blocked: Option<Arc<BlockedHook>>,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            max_workers: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            on_blocked: None,
        }
    }
}

impl fmt::Debug for BindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindOptions")
            .field("max_workers", &self.max_workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("poll_interval", &self.poll_interval)
            .field("on_blocked", &self.on_blocked.is_some())
            .finish()
    }
}

impl BindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use only the first `n` slots. Checked against the pool on every run.
    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = Some(n);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Called on the producer thread each time the queue is full.
    pub fn on_blocked<H>(mut self, hook: H) -> Self
    where
        H: Fn(&RunState) + Send + Sync + 'static,
    {
        self.on_blocked = Some(Arc::new(hook));
        self
    }
}

/// What a finished job looked like from the engine's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub workers: usize,
    pub enqueued: usize,
    pub delivered: usize,
    /// Enqueued items no consumer picked up, non-zero only after an abort
    /// or when every partition failed.
    pub dropped: usize,
    pub aborted: bool,
}

/// A stream processor bound to a pool; callable any number of times, one
/// job at a time.
pub struct BoundRunner<T, A> {
    pool: WorkerPool,
    stream_proc: Arc<StreamProc<T, A>>,
    options: BindOptions,
}

impl<T, A> Clone for BoundRunner<T, A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            stream_proc: Arc::clone(&self.stream_proc),
            options: self.options.clone(),
        }
    }
}

impl<T, A> BoundRunner<T, A>
where
    T: Send + 'static,
    A: Send + Sync + 'static,
{
    /// Process `source` across the pool, blocking until every partition has
    /// finished. `args` is shared by all partitions of this job.
    pub fn run<S>(&self, source: S, args: A) -> Result<JobReport>
    where
        S: IntoIterator<Item = T>,
    {
        self.execute(self.options.max_workers, source, args)
    }

    /// Like [`run`](Self::run) but on the first `max_workers` slots only.
    pub fn run_with_workers<S>(&self, max_workers: usize, source: S, args: A) -> Result<JobReport>
    where
        S: IntoIterator<Item = T>,
    {
        self.execute(Some(max_workers), source, args)
    }

    pub fn abort(&self) {
        self.pool.abort();
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn resolve_workers(&self, requested: Option<usize>) -> Result<usize> {
        let available = self.pool.num_workers();
        match requested {
            None => Ok(available),
            Some(n) if (1..=available).contains(&n) => Ok(n),
            Some(n) => Err(Error::InvalidWorkerCount {
                requested: n,
                available,
            }),
        }
    }

    fn execute<S>(&self, max_workers: Option<usize>, source: S, args: A) -> Result<JobReport>
    where
        S: IntoIterator<Item = T>,
    {
        let workers = self.resolve_workers(max_workers)?;
        let (pump, partitions) = relay::split(
            source,
            workers,
            self.options.queue_capacity,
            self.options.poll_interval,
        )?;
        let state = Arc::clone(pump.state());
        let _job = self.pool.begin_job(Arc::clone(&state))?;
        debug!(pool = self.pool.id(), workers, "job started");

        let args = Arc::new(args);
        let tasks: Vec<_> = partitions
            .into_iter()
            .map(|partition| {
                let stream_proc = Arc::clone(&self.stream_proc);
                let args = Arc::clone(&args);
                move || stream_proc(partition, &*args)
            })
            .collect();
        let in_flight = self.pool.dispatch(Arc::clone(&state), tasks);

        let hook = self
            .options
            .on_blocked
            .as_deref()
            .map(|hook| hook as &dyn Fn(&RunState));
        let stats = pump.run(hook);
        let settled = in_flight.settle();

        let delivered = state.delivered();
        let report = JobReport {
            workers,
            enqueued: stats.enqueued,
            delivered,
            dropped: stats.enqueued.saturating_sub(delivered),
            aborted: stats.aborted || state.is_aborted(),
        };
        if report.aborted {
            warn!(dropped = report.dropped, delivered, "job aborted");
        }
        debug!(?report, "job finished");

        settled.map(|_| report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_workers_capped() {
        let n = default_num_workers();
        assert!(n >= 1 && n <= 8);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(Error::InvalidPoolSize)));
    }

    #[test]
    fn test_slot_identity_stable_across_calls() {
        let pool = WorkerPool::new(3).unwrap();
        let identify = {
            let pool = pool.clone();
            move |_: usize| (pool.current_slot(), std::thread::current().id())
        };
        let first = pool.broadcast(identify.clone()).unwrap();
        let second = pool.broadcast(identify).unwrap();

        assert_eq!(first, second);
        let slots: Vec<_> = first.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(pool.current_slot(), None);
    }

    #[test]
    fn test_thread_names() {
        let pool = WorkerPool::new(2).unwrap();
        let names = pool
            .broadcast(|_| std::thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(
            names,
            vec![Some("pstream-slot-0".to_string()), Some("pstream-slot-1".to_string())]
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&payload), "bang");
    }
}
