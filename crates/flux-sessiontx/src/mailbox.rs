//! The cross-thread event mailbox: a bounded MPSC ring, any number of
//! producer threads pushing in, one worker thread draining it each tick.
//!
//! The consumer side never blocks: a tick that can't acquire the lock
//! without waiting abandons intake entirely rather than stalling the
//! worker. Producers block on full and are woken once the mailbox drains
//! below one-eighth capacity.

use std::{
    collections::VecDeque,
    sync::{
        Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::event::SessionEvent;

pub struct EventMailbox {
    capacity: usize,
    inner: Mutex<VecDeque<SessionEvent>>,
    not_full: Condvar,
    /// Lock-free hint, not authoritative. Lets `drain_and_merge` skip the
    /// trylock entirely when the mailbox is almost certainly empty.
    approx_len: AtomicUsize,
}

impl EventMailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            approx_len: AtomicUsize::new(0),
        }
    }

    /// Cheap, lock-free check useful as a pre-filter before attempting the
    /// trylock. May be stale by the time the caller acts on it; that's fine,
    /// it only ever causes a skipped intake attempt, never a lost event.
    pub fn is_probably_empty(&self) -> bool {
        self.approx_len.load(Ordering::Relaxed) == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Producer-side push. Blocks while the mailbox is at capacity.
    pub fn push(&self, event: SessionEvent) {
        let mut guard = self.inner.lock().unwrap();
        while guard.len() >= self.capacity {
            guard = self.not_full.wait(guard).unwrap();
        }
        guard.push_back(event);
        self.approx_len.fetch_add(1, Ordering::Relaxed);
    }

    /// Non-blocking producer push. Returns `false` if the mailbox was full.
    pub fn try_push(&self, event: SessionEvent) -> bool {
        let Ok(mut guard) = self.inner.lock() else { return false };
        if guard.len() >= self.capacity {
            return false;
        }
        guard.push_back(event);
        self.approx_len.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Consumer-side drain: copies every currently-queued event into `out`
    /// and empties the mailbox, under a short-held lock. If the lock can't
    /// be acquired without waiting, the whole call is a no-op and returns 0
    /// — a cooperative yield, not an error, matching the worker's
    /// never-block contract.
    pub fn try_drain_into(&self, out: &mut Vec<SessionEvent>) -> usize {
        let Ok(mut guard) = self.inner.try_lock() else { return 0 };
        let n = guard.len();
        if n == 0 {
            return 0;
        }
        out.extend(guard.drain(..));
        drop(guard);
        self.approx_len.fetch_sub(n, Ordering::Relaxed);
        // Drained to empty, which is always below one-eighth capacity.
        self.not_full.notify_all();
        n
    }

    /// Snapshot of currently-queued events, for the debug dump. Never used
    /// on the hot path.
    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.inner.lock().map(|g| g.iter().copied().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
