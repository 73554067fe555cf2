//! Bounded fan-out of one producer stream into N consumer partitions.
//!
//! A single shared queue feeds every partition, so whichever consumer is idle
//! pulls the next item. Items keep producer order inside one partition, but
//! which partition receives which item depends on load. Callers that need to
//! reassemble results carry their own index inside each item.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::iter::FusedIterator;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::error::{Error, Result};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Queue payload. The end marker is a variant of its own, so no work item
/// can ever be mistaken for it.
enum Message<T> {
    Item(T),
    End,
}

/// Shared coordination state of one relay run.
#[derive(Debug)]
pub struct RunState {
    aborted: AtomicBool,
    delivered: AtomicUsize,
    live: Mutex<usize>,
    retired: Condvar,
}

impl RunState {
    pub(crate) fn new(partitions: usize) -> Self {
        Self {
            aborted: AtomicBool::new(false),
            delivered: AtomicUsize::new(0),
            live: Mutex::new(partitions),
            retired: Condvar::new(),
        }
    }

    /// Request a cooperative stop. Idempotent, never reset.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Items handed out to consumers so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    /// Partitions that have neither seen their end marker nor been dropped.
    pub fn live_partitions(&self) -> usize {
        *self.live.lock()
    }

    fn retire(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.retired.notify_all();
        }
    }

    /// Block until every partition retired. Returns `false` on abort.
    fn wait_retired(&self, poll: Duration) -> bool {
        let mut live = self.live.lock();
        while *live > 0 {
            if self.is_aborted() {
                return false;
            }
            self.retired.wait_for(&mut live, poll);
        }
        true
    }
}

/// Cloneable handle that aborts one specific run.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<RunState>);

impl AbortHandle {
    pub(crate) fn new(state: Arc<RunState>) -> Self {
        Self(state)
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.is_aborted()
    }
}

/// Outcome of one producer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Work items that made it into the queue.
    pub enqueued: usize,
    pub aborted: bool,
}

/// Producer half of a relay. Must be run exactly once, consuming it.
pub struct Pump<I: Iterator> {
    source: I,
    tx: Sender<Message<I::Item>>,
    partitions: usize,
    poll: Duration,
    state: Arc<RunState>,
}

impl<I: Iterator> Pump<I> {
    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(Arc::clone(&self.state))
    }

    /// Drive the source into the queue, then emit one end marker per
    /// partition and wait until every partition has retired.
    ///
    /// `on_blocked` is invoked each time an enqueue attempt times out on a
    /// full queue. The run stops early once the state is aborted or every
    /// partition is gone; items still queued at that point are not drained.
    pub fn run(self, on_blocked: Option<&dyn Fn(&RunState)>) -> RelayStats {
        let Pump {
            source,
            tx,
            partitions,
            poll,
            state,
        } = self;

        let mut enqueued = 0;
        for item in source {
            if !offer(&tx, Message::Item(item), &state, poll, on_blocked) {
                return RelayStats {
                    enqueued,
                    aborted: state.is_aborted(),
                };
            }
            enqueued += 1;
        }

        for _ in 0..partitions {
            if !offer(&tx, Message::End, &state, poll, on_blocked) {
                return RelayStats {
                    enqueued,
                    aborted: state.is_aborted(),
                };
            }
        }

        let drained = state.wait_retired(poll);
        RelayStats {
            enqueued,
            aborted: !drained || state.is_aborted(),
        }
    }
}

fn offer<T>(
    tx: &Sender<Message<T>>,
    mut message: Message<T>,
    state: &RunState,
    poll: Duration,
    on_blocked: Option<&dyn Fn(&RunState)>,
) -> bool {
    loop {
        if state.is_aborted() || state.live_partitions() == 0 {
            return false;
        }
        match tx.send_timeout(message, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                message = back;
                trace!("relay queue full, producer blocked");
                if let Some(hook) = on_blocked {
                    hook(state);
                }
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Consumer half of a relay: a lazy, single-pass sequence of work items.
///
/// Ends on its end marker, on abort, or when the producer is gone. Dropping
/// a partition early retires it, so the producer never waits on it.
pub struct Partition<T> {
    index: usize,
    rx: Option<Receiver<Message<T>>>,
    poll: Duration,
    state: Arc<RunState>,
}

impl<T> Partition<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(Arc::clone(&self.state))
    }

    fn retire(&mut self) {
        if self.rx.take().is_some() {
            self.state.retire();
        }
    }
}

impl<T> Iterator for Partition<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if self.state.is_aborted() {
                self.retire();
                return None;
            }
            let rx = self.rx.as_ref()?;
            match rx.recv_timeout(self.poll) {
                Ok(Message::Item(item)) => {
                    self.state.delivered.fetch_add(1, Ordering::AcqRel);
                    return Some(item);
                }
                Ok(Message::End) | Err(RecvTimeoutError::Disconnected) => {
                    self.retire();
                    return None;
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }
}

impl<T> FusedIterator for Partition<T> {}

impl<T> Drop for Partition<T> {
    fn drop(&mut self) {
        self.retire();
    }
}

/// Split `source` into `partitions` consumer sequences fed by one queue of
/// `capacity` slots, polling every `poll` while blocked.
pub fn split<S>(
    source: S,
    partitions: usize,
    capacity: usize,
    poll: Duration,
) -> Result<(Pump<S::IntoIter>, Vec<Partition<S::Item>>)>
where
    S: IntoIterator,
{
    if partitions == 0 {
        return Err(Error::ZeroPartitions);
    }
    if capacity == 0 {
        return Err(Error::ZeroCapacity);
    }

    let (tx, rx) = bounded(capacity);
    let state = Arc::new(RunState::new(partitions));

    let consumers = (0..partitions)
        .map(|index| Partition {
            index,
            rx: Some(rx.clone()),
            poll,
            state: Arc::clone(&state),
        })
        .collect();

    let pump = Pump {
        source: source.into_iter(),
        tx,
        partitions,
        poll,
        state,
    };

    Ok((pump, consumers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const POLL: Duration = Duration::from_millis(5);

    fn drain_all(
        partitions: Vec<Partition<usize>>,
        pump: Pump<std::ops::Range<usize>>,
    ) -> (Vec<Vec<usize>>, RelayStats) {
        thread::scope(|scope| {
            let handles: Vec<_> = partitions
                .into_iter()
                .map(|p| scope.spawn(move || p.collect::<Vec<_>>()))
                .collect();
            let stats = pump.run(None);
            let seen = handles.into_iter().map(|h| h.join().unwrap()).collect();
            (seen, stats)
        })
    }

    #[test]
    fn test_every_item_delivered_once() {
        let (pump, partitions) = split(0..500usize, 4, 8, POLL).unwrap();
        let state = Arc::clone(pump.state());
        let (seen, stats) = drain_all(partitions, pump);

        let mut all: Vec<usize> = seen.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..500).collect::<Vec<_>>());
        assert_eq!(stats, RelayStats { enqueued: 500, aborted: false });
        assert_eq!(state.delivered(), 500);
        assert_eq!(state.live_partitions(), 0);
    }

    #[test]
    fn test_order_kept_within_partition() {
        let (pump, partitions) = split(0..300usize, 3, 4, POLL).unwrap();
        let (seen, _) = drain_all(partitions, pump);
        for part in seen {
            assert!(part.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_empty_source_terminates_all_partitions() {
        let (pump, partitions) = split(0..0usize, 5, 1, POLL).unwrap();
        let (seen, stats) = drain_all(partitions, pump);
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(Vec::is_empty));
        assert_eq!(stats.enqueued, 0);
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(split(0..1usize, 0, 1, POLL), Err(Error::ZeroPartitions)));
        assert!(matches!(split(0..1usize, 1, 0, POLL), Err(Error::ZeroCapacity)));
    }

    #[test]
    fn test_backpressure_invokes_hook() {
        let (pump, mut partitions) = split(0..10usize, 1, 1, POLL).unwrap();
        let partition = partitions.pop().unwrap();
        let blocked = AtomicUsize::new(0);
        let hook = |_: &RunState| {
            blocked.fetch_add(1, Ordering::Relaxed);
        };

        let seen = thread::scope(|scope| {
            let consumer = scope.spawn(move || {
                partition
                    .inspect(|_| thread::sleep(Duration::from_millis(10)))
                    .collect::<Vec<_>>()
            });
            pump.run(Some(&hook));
            consumer.join().unwrap()
        });

        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(blocked.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_abort_from_hook_stops_producer() {
        let (pump, mut partitions) = split(0usize.., 1, 2, POLL).unwrap();
        let partition = partitions.pop().unwrap();

        let stats = thread::scope(|scope| {
            scope.spawn(move || {
                partition.for_each(|_| thread::sleep(Duration::from_millis(20)));
            });
            pump.run(Some(&|state: &RunState| state.abort()))
        });

        assert!(stats.aborted);
    }

    #[test]
    fn test_dropped_partition_does_not_block_producer() {
        let (pump, mut partitions) = split(0..50usize, 2, 4, POLL).unwrap();
        drop(partitions.pop());
        let (seen, stats) = drain_all(partitions, pump);
        assert_eq!(seen[0], (0..50).collect::<Vec<_>>());
        assert!(!stats.aborted);
    }

    #[test]
    fn test_all_partitions_dropped_stops_producer() {
        let (pump, partitions) = split(0usize.., 3, 2, POLL).unwrap();
        drop(partitions);
        let stats = pump.run(None);
        assert!(!stats.aborted);
        assert!(stats.enqueued <= 2);
    }

    #[test]
    fn test_partitions_numbered_in_order() {
        let (_pump, partitions) = split(0..1usize, 4, 1, POLL).unwrap();
        let indices: Vec<_> = partitions.iter().map(Partition::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_abort_handles_share_one_run() {
        let (pump, partitions) = split(0..1000usize, 2, 4, POLL).unwrap();
        let from_pump = pump.abort_handle();
        let from_partition = partitions[1].abort_handle();
        assert!(!from_pump.is_aborted());

        from_partition.abort();
        assert!(from_pump.is_aborted());
        assert!(pump.state().is_aborted());

        let (seen, stats) = drain_all(partitions, pump);
        assert!(stats.aborted);
        assert_eq!(stats.enqueued, 0);
        assert!(seen.iter().all(Vec::is_empty));
    }
}
