//! Engine configuration. Constructed programmatically — there's no
//! file-based config layer for this crate, matching how `flux-network`'s
//! `TcpConnector` is set up via plain builder methods rather than a config
//! file format.

use flux_timing::Duration;

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Max TX segments emitted in one dispatcher tick, across all events.
    pub frame_size: u32,
    /// Capacity of the cross-thread event mailbox.
    pub mailbox_capacity: usize,
    /// Pool buffer size in bytes (`B` in the sizing math).
    pub buffer_size: usize,
    /// Bytes of headroom reserved per buffer for transport header push (`H`).
    pub headroom: usize,
    /// Disabled by default — see `spec` §9 open question 1. When set,
    /// `drain_and_merge` skips intake for a tick once the combined pending
    /// queues reach this length.
    pub pending_backlog_cap: Option<usize>,
    /// Timeout between unprompted periodic-process wakeups.
    pub periodic_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_size: 256,
            mailbox_capacity: 1024,
            buffer_size: 2048,
            headroom: 128,
            pending_backlog_cap: None,
            periodic_timeout: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn with_frame_size(mut self, frame_size: u32) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_buffers(mut self, buffer_size: usize, headroom: usize) -> Self {
        self.buffer_size = buffer_size;
        self.headroom = headroom;
        self
    }

    pub fn with_pending_backlog_cap(mut self, cap: Option<usize>) -> Self {
        self.pending_backlog_cap = cap;
        self
    }

    pub fn with_periodic_timeout(mut self, timeout: Duration) -> Self {
        self.periodic_timeout = timeout;
        self
    }
}
