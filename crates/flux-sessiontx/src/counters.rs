//! The three counters the engine exposes: packets sent, timer firings, and
//! buffer-pool exhaustion events. Plain atomics — one `EngineCounters` per
//! engine instance, read by whatever metrics/CLI surface wants a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct EngineCounters {
    tx: AtomicU64,
    timer: AtomicU64,
    no_buffer: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineCountersSnapshot {
    pub tx: u64,
    pub timer: u64,
    pub no_buffer: u64,
}

impl EngineCounters {
    pub fn add_tx(&self, n: u64) {
        self.tx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_timer(&self) {
        self.timer.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_no_buffer(&self) {
        self.no_buffer.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineCountersSnapshot {
        EngineCountersSnapshot {
            tx: self.tx.load(Ordering::Relaxed),
            timer: self.timer.load(Ordering::Relaxed),
            no_buffer: self.no_buffer.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let c = EngineCounters::default();
        c.add_tx(3);
        c.inc_timer();
        c.inc_no_buffer();
        c.inc_no_buffer();
        let s = c.snapshot();
        assert_eq!(s, EngineCountersSnapshot { tx: 3, timer: 1, no_buffer: 2 });
    }
}
