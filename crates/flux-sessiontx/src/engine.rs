//! The engine itself: owns one worker thread's share of sessions, the
//! transport binding, the buffer pool, the downstream sink, and the queues
//! that make up the dispatch loop. One `Engine` per worker thread — no
//! state is shared across engines.

use crate::{
    buffer::{BufferHandle, BufferPool},
    config::EngineConfig,
    counters::EngineCounters,
    event::SessionEvent,
    mailbox::EventMailbox,
    pipeline::NextNodeSink,
    session::SessionTable,
    transport::TxTransport,
};

pub struct Engine<T: TxTransport, B: BufferPool, N: NextNodeSink> {
    pub sessions: SessionTable,
    pub transport: T,
    pub buffer_pool: B,
    pub next_node: N,
    pub mailbox: EventMailbox,
    pub counters: EngineCounters,
    pub config: EngineConfig,

    pub(crate) pending_events: Vec<SessionEvent>,
    pub(crate) pending_disconnects: Vec<SessionEvent>,
    pub(crate) free_event_scratch: Vec<SessionEvent>,
    /// Per-thread cache of provisioned-but-unused buffers, popped LIFO.
    /// Refilled in bulk from `buffer_pool` when it runs short.
    pub(crate) tx_buffers: Vec<BufferHandle>,
    /// Reset to 0 at the start of every `run_tick`; bounds the number of
    /// segments emitted per tick to `config.frame_size`.
    pub(crate) n_tx_packets_this_tick: u32,
}

impl<T: TxTransport, B: BufferPool, N: NextNodeSink> Engine<T, B, N> {
    pub fn new(transport: T, buffer_pool: B, next_node: N, config: EngineConfig) -> Self {
        Self {
            sessions: SessionTable::new(),
            transport,
            buffer_pool,
            next_node,
            mailbox: EventMailbox::new(config.mailbox_capacity),
            counters: EngineCounters::default(),
            config,
            pending_events: Vec::new(),
            pending_disconnects: Vec::new(),
            free_event_scratch: Vec::new(),
            tx_buffers: Vec::new(),
            n_tx_packets_this_tick: 0,
        }
    }

    pub fn pending_backlog(&self) -> usize {
        self.pending_events.len() + self.pending_disconnects.len()
    }
}
