//! The periodic process: a long-running cooperative task, independent of
//! any TX worker, that wakes on a timeout or an explicit kick and advances
//! transport time so retransmit/keepalive timers fire.
//!
//! The crate has no process/coroutine runtime of its own, so this is
//! modeled as its own OS thread racing a timeout against an mpsc receiver —
//! booted with `flux_utils::thread_boot` and spanned with `tracing` the
//! same way `flux::tile::attach_tile` boots a pinned worker thread.

use std::{
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
};

use flux_timing::Duration;
use flux_utils::{ThreadPriority, thread_boot};
use tracing::{Level, span};

enum PeriodicKick {
    Tick,
    /// Raises the wake timeout to effectively-infinite; the process still
    /// only ever exits via `Drop`, matching the original's "stop" kick
    /// which quiesces periodic firing rather than tearing the process down.
    Stop,
}

/// Handle to a running periodic process. Dropping it joins the background
/// thread.
pub struct PeriodicProcess {
    tx: Option<Sender<PeriodicKick>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicProcess {
    /// Spawns the process with the given base timeout. `on_wake` runs on
    /// the periodic thread itself, never on a TX worker thread — callers
    /// that need to touch worker-owned state from here must hop back
    /// through that worker's own channel (e.g. an `Rpc` event).
    pub fn spawn<F>(timeout: Duration, mut on_wake: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _span = span!(Level::INFO, "", tile = "session-tx-periodic").entered();
            thread_boot(None, ThreadPriority::OSDefault);

            let mut current_timeout: std::time::Duration = timeout.into();
            loop {
                match rx.recv_timeout(current_timeout) {
                    Ok(PeriodicKick::Tick) => on_wake(),
                    Ok(PeriodicKick::Stop) => current_timeout = std::time::Duration::MAX,
                    Err(RecvTimeoutError::Timeout) => on_wake(),
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self { tx: Some(tx), handle: Some(handle) }
    }

    /// Wakes the process immediately, ahead of its timeout.
    pub fn kick(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(PeriodicKick::Tick);
        }
    }

    /// Quiesces periodic firing: the process stops waking on its own until
    /// the next explicit `kick`.
    pub fn stop_periodic(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(PeriodicKick::Stop);
        }
    }
}

impl Drop for PeriodicProcess {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel, waking the thread
        // out of `recv_timeout` (even an infinite one) with `Disconnected`.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
