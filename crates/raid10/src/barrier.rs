//! Admission control between foreground I/O and background passes.
//!
//! Foreground requests enter with [`Barrier::wait_barrier`] and leave with
//! [`Barrier::allow_barrier`]. Resync and recovery raise the barrier around
//! each chunk, which stops new foreground entries and waits for the ones in
//! flight to drain. Error repair freezes the array, which additionally
//! tolerates requests parked on the retry queue.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Default number of background chunks allowed in flight at once.
pub const DEFAULT_RESYNC_DEPTH: u32 = 32;

/// Counters guarded by the admission lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierState {
    /// Background operations currently excluding foreground I/O.
    pub barrier: u32,
    /// Foreground requests waiting for the barrier to drop.
    pub nr_waiting: u32,
    /// Foreground requests admitted and not yet finished.
    pub nr_pending: u32,
    /// Admitted requests parked on the retry queue.
    pub nr_queued: u32,
}

/// Counter-based gate.
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    wait: Condvar,
    depth: u32,
}

impl Barrier {
    /// Creates a gate allowing `depth` concurrent background chunks.
    pub fn new(depth: u32) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            wait: Condvar::new(),
            depth: depth.max(1),
        }
    }

    /// Admits a foreground request, blocking while a barrier is raised.
    pub fn wait_barrier(&self) {
        let mut state = self.state.lock();
        if state.barrier > 0 {
            state.nr_waiting += 1;
            while state.barrier > 0 {
                self.wait.wait(&mut state);
            }
            state.nr_waiting -= 1;
            // A raiser may be waiting for nr_waiting to reach zero.
            self.wait.notify_all();
        }
        state.nr_pending += 1;
    }

    /// Admits a request on behalf of a caller already holding admission.
    pub(crate) fn nested_enter(&self) {
        self.state.lock().nr_pending += 1;
    }

    /// Releases one foreground admission.
    pub fn allow_barrier(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.nr_pending > 0, "allow_barrier without admission");
        state.nr_pending = state.nr_pending.saturating_sub(1);
        self.wait.notify_all();
    }

    /// Raises the barrier for one background chunk.
    ///
    /// Without `force`, waits until no foreground request is queued at the
    /// gate so that foreground I/O is not starved. Then waits until every
    /// admitted request has finished and fewer than the pipeline depth of
    /// chunks are outstanding.
    pub fn raise_barrier(&self, force: bool) {
        let mut state = self.state.lock();
        if !force {
            while state.nr_waiting > 0 {
                self.wait.wait(&mut state);
            }
        }
        state.barrier += 1;
        while state.nr_pending > 0 || state.barrier > self.depth {
            self.wait.wait(&mut state);
        }
        trace!(barrier = state.barrier, "barrier raised");
    }

    /// Drops one background chunk's barrier.
    pub fn lower_barrier(&self) {
        let mut state = self.state.lock();
        state.barrier = state.barrier.saturating_sub(1);
        self.wait.notify_all();
    }

    /// Stops foreground I/O and waits until the only admitted requests are
    /// the ones parked on the retry queue plus `extra` held by the caller.
    pub fn freeze_array(&self, extra: u32) {
        let mut state = self.state.lock();
        state.barrier += 1;
        state.nr_waiting += 1;
        while state.nr_pending != state.nr_queued + extra {
            self.wait.wait(&mut state);
        }
        trace!(nr_pending = state.nr_pending, "array frozen");
    }

    /// Reverses [`Barrier::freeze_array`].
    pub fn unfreeze_array(&self) {
        let mut state = self.state.lock();
        state.barrier = state.barrier.saturating_sub(1);
        state.nr_waiting = state.nr_waiting.saturating_sub(1);
        self.wait.notify_all();
    }

    /// Counts an admitted request parked on the retry queue.
    pub(crate) fn inc_queued(&self) {
        self.state.lock().nr_queued += 1;
        self.wait.notify_all();
    }

    /// A parked request was picked up by the worker.
    pub(crate) fn dec_queued(&self) {
        let mut state = self.state.lock();
        state.nr_queued = state.nr_queued.saturating_sub(1);
        self.wait.notify_all();
    }

    /// Waits until no background chunk holds the barrier.
    pub fn close_sync(&self) {
        self.wait_barrier();
        self.allow_barrier();
    }

    /// Current counters.
    pub fn snapshot(&self) -> BarrierState {
        *self.state.lock()
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new(DEFAULT_RESYNC_DEPTH)
    }
}
