//! Worker-slot-scoped storage.
//!
//! One lazily created value per slot of a [`WorkerPool`], reachable only from
//! that slot's thread. Values live as long as the `SlotLocal` itself, which
//! makes it the place to keep expensive per-thread resources (sessions,
//! handles, scratch buffers) between jobs.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::parallel::{slot_in, WorkerPool};

struct Entry<T> {
    value: Mutex<Option<T>>,
    /// Set while the owning slot is inside `with`/`with_existing`.
    active: AtomicBool,
}

/// One access to the calling slot's entry; releases it on drop.
struct Access<'a, T> {
    slot: usize,
    entry: &'a Entry<T>,
}

impl<T> Drop for Access<'_, T> {
    fn drop(&mut self) {
        self.entry.active.store(false, Ordering::Release);
    }
}

pub struct SlotLocal<T> {
    pool_id: usize,
    values: Box<[Entry<T>]>,
}

impl<T> std::fmt::Debug for SlotLocal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLocal")
            .field("pool_id", &self.pool_id)
            .field("slots", &self.values.len())
            .field("initialized", &self.initialized())
            .finish()
    }
}

impl<T> SlotLocal<T> {
    pub fn new(pool: &WorkerPool) -> Self {
        let values = (0..pool.num_workers())
            .map(|_| Entry {
                value: Mutex::new(None),
                active: AtomicBool::new(false),
            })
            .collect();
        Self {
            pool_id: pool.id(),
            values,
        }
    }

    fn enter(&self) -> Result<Access<'_, T>> {
        let slot = slot_in(self.pool_id).ok_or(Error::SlotUnavailable)?;
        let entry = &self.values[slot];
        // Only the slot's own thread sets the flag, so finding it set means
        // `f` called back into this storage.
        if entry.active.swap(true, Ordering::Acquire) {
            return Err(Error::SlotBusy { slot });
        }
        Ok(Access { slot, entry })
    }

    /// Run `f` on the calling slot's value, creating it with `init` first if
    /// this slot has none yet.
    ///
    /// Not reentrant: calling `with` or `with_existing` on the same storage
    /// from inside `f` fails with [`Error::SlotBusy`].
    pub fn with<R>(&self, init: impl FnOnce(usize) -> T, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let access = self.enter()?;
        let mut cell = access.entry.value.lock();
        let value = cell.get_or_insert_with(|| init(access.slot));
        Ok(f(value))
    }

    /// Run `f` on the calling slot's value only if it already exists.
    pub fn with_existing<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<Option<R>> {
        let access = self.enter()?;
        let mut cell = access.entry.value.lock();
        Ok(cell.as_mut().map(f))
    }

    pub fn is_initialized(&self, slot: usize) -> bool {
        self.values
            .get(slot)
            .is_some_and(|entry| entry.value.lock().is_some())
    }

    /// Number of slots holding a value.
    pub fn initialized(&self) -> usize {
        self.values
            .iter()
            .filter(|entry| entry.value.lock().is_some())
            .count()
    }

    /// Remove every value, returned in slot order.
    pub fn take_all(&self) -> Vec<Option<T>> {
        self.values.iter().map(|entry| entry.value.lock().take()).collect()
    }
}

impl<T: Send + 'static> SlotLocal<T> {
    /// Eagerly create the value on every slot of `pool`.
    pub fn prime<F>(self: &Arc<Self>, pool: &WorkerPool, init: F) -> Result<()>
    where
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        if pool.id() != self.pool_id {
            return Err(Error::SlotUnavailable);
        }
        let local = Arc::clone(self);
        pool.broadcast(move |_| local.with(&init, |_| ()))?
            .into_iter()
            .collect()
    }
}
