//! Index-based pool of replica sets.
//!
//! Sets live in a fixed arena and are addressed by [`SetHandle`], an index
//! plus a generation. Releasing a set bumps the generation so a late
//! completion carrying an old handle is rejected instead of touching a
//! recycled set. The free list sits behind a short mutex; `remaining`
//! counters are atomics updated from completion context.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{RaidError, RaidResult};
use crate::replica::ReplicaSet;

/// Generation-checked reference to a pooled set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SetHandle {
    index: u32,
    generation: u32,
}

impl SetHandle {
    /// Arena index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation at allocation time.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct PoolEntry {
    generation: AtomicU32,
    remaining: AtomicU32,
    set: Mutex<Option<ReplicaSet>>,
}

/// Fixed-capacity arena of replica sets.
pub struct SetPool {
    entries: Box<[PoolEntry]>,
    free: Mutex<Vec<u32>>,
    freed: Condvar,
    reserve: usize,
}

impl SetPool {
    /// Creates a pool of `capacity` sets for foreground I/O plus `reserve`
    /// sets only background allocation may use.
    pub fn new(capacity: usize, reserve: usize) -> Self {
        let total = capacity + reserve;
        let entries = (0..total)
            .map(|_| PoolEntry {
                generation: AtomicU32::new(0),
                remaining: AtomicU32::new(0),
                set: Mutex::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entries,
            free: Mutex::new((0..total as u32).rev().collect()),
            freed: Condvar::new(),
            reserve,
        }
    }

    /// Sets not currently allocated.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Allocates without waiting. Fails with a retryable error when only the
    /// background reserve is left.
    pub fn try_alloc(&self, set: ReplicaSet) -> RaidResult<SetHandle> {
        let index = {
            let mut free = self.free.lock();
            if free.len() <= self.reserve {
                return Err(RaidError::PoolExhausted {
                    capacity: self.entries.len() - self.reserve,
                });
            }
            free.pop()
        };
        match index {
            Some(index) => Ok(self.install(index, set)),
            None => Err(RaidError::PoolExhausted {
                capacity: self.entries.len() - self.reserve,
            }),
        }
    }

    /// Allocates, waiting for a set to be released if none is free.
    pub fn alloc_wait(&self, set: ReplicaSet) -> SetHandle {
        let index = {
            let mut free = self.free.lock();
            loop {
                if let Some(index) = free.pop() {
                    break index;
                }
                self.freed.wait(&mut free);
            }
        };
        self.install(index, set)
    }

    fn install(&self, index: u32, set: ReplicaSet) -> SetHandle {
        let entry = &self.entries[index as usize];
        entry.remaining.store(0, Ordering::Release);
        *entry.set.lock() = Some(set);
        SetHandle {
            index,
            generation: entry.generation.load(Ordering::Acquire),
        }
    }

    fn entry(&self, handle: SetHandle) -> Option<&PoolEntry> {
        let entry = self.entries.get(handle.index as usize)?;
        if entry.generation.load(Ordering::Acquire) != handle.generation {
            warn!(
                index = handle.index,
                generation = handle.generation,
                "stale replica set handle"
            );
            return None;
        }
        Some(entry)
    }

    /// Runs `f` on the set. Returns `None` for a stale handle.
    pub fn with<R>(&self, handle: SetHandle, f: impl FnOnce(&mut ReplicaSet) -> R) -> Option<R> {
        let entry = self.entry(handle)?;
        let mut guard = entry.set.lock();
        guard.as_mut().map(f)
    }

    /// Sets the outstanding-completion count before I/O is issued.
    pub fn set_remaining(&self, handle: SetHandle, count: u32) {
        if let Some(entry) = self.entry(handle) {
            entry.remaining.store(count, Ordering::Release);
        }
    }

    /// Adds one outstanding completion.
    pub fn inc_remaining(&self, handle: SetHandle) {
        if let Some(entry) = self.entry(handle) {
            entry.remaining.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drops one outstanding completion. Returns true for the caller that
    /// brought the count to zero, which then owns final completion.
    pub fn dec_remaining(&self, handle: SetHandle) -> bool {
        match self.entry(handle) {
            Some(entry) => {
                let prev = entry.remaining.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0, "remaining underflow on set {}", handle.index);
                prev == 1
            }
            None => false,
        }
    }

    /// Current outstanding-completion count.
    pub fn remaining(&self, handle: SetHandle) -> u32 {
        self.entry(handle)
            .map(|e| e.remaining.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Returns the set to the pool and hands back its contents. A second
    /// release of the same handle returns `None`.
    pub fn release(&self, handle: SetHandle) -> Option<ReplicaSet> {
        let entry = self.entry(handle)?;
        let set = {
            let mut guard = entry.set.lock();
            // Re-check under the set lock so concurrent releases race safely.
            if entry.generation.load(Ordering::Acquire) != handle.generation {
                return None;
            }
            entry.generation.fetch_add(1, Ordering::AcqRel);
            guard.take()
        };
        self.free.lock().push(handle.index);
        self.freed.notify_all();
        set
    }

    /// Waits until every set is back in the pool.
    pub fn wait_idle(&self) {
        let mut free = self.free.lock();
        while free.len() < self.entries.len() {
            self.freed.wait(&mut free);
        }
    }
}

impl std::fmt::Debug for SetPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetPool")
            .field("capacity", &self.entries.len())
            .field("reserve", &self.reserve)
            .field("available", &self.available())
            .finish()
    }
}
