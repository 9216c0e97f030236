//! The event dispatcher: drains the mailbox and the two deferred queues
//! into one ordered batch, then walks it once per tick, branching on event
//! kind. Runs entirely on the owning worker thread; no handler here ever
//! blocks.

use tracing::warn;

use crate::{
    buffer::BufferPool,
    engine::Engine,
    event::SessionEvent,
    pipeline::{NextNodeSink, TxOutcome},
    transport::{TxTransport, TxType},
};

impl<T: TxTransport, B: BufferPool, N: NextNodeSink> Engine<T, B, N> {
    /// Drains the cross-thread mailbox and appends the thread-local
    /// deferred queues, in that order, into `free_event_scratch`. Returns
    /// the number of events merged. A tick that can't acquire the mailbox
    /// lock without waiting, or whose combined pending queues are already
    /// at the (disabled-by-default) backlog cap, merges nothing and
    /// returns 0 — a cooperative yield, not an error.
    pub(crate) fn drain_and_merge(&mut self) -> usize {
        self.free_event_scratch.clear();

        if let Some(cap) = self.config.pending_backlog_cap
            && self.pending_backlog() >= cap
        {
            return 0;
        }

        if self.mailbox.is_probably_empty()
            && self.pending_events.is_empty()
            && self.pending_disconnects.is_empty()
        {
            return 0;
        }

        self.mailbox.try_drain_into(&mut self.free_event_scratch);
        self.free_event_scratch.append(&mut self.pending_events);
        self.free_event_scratch.append(&mut self.pending_disconnects);
        self.free_event_scratch.len()
    }

    /// Runs one dispatch tick: drains+merges events, then dispatches each
    /// in order, enforcing the per-tick frame budget on TX events.
    /// `on_builtin_rx(session_index, app_index)` and
    /// `on_disconnect(session_index)` are the hooks into the
    /// application/session-manager layers this crate doesn't own.
    pub fn run_tick(
        &mut self,
        on_builtin_rx: &mut dyn FnMut(u32, u32),
        on_disconnect: &mut dyn FnMut(u32),
    ) -> usize {
        self.n_tx_packets_this_tick = 0;

        let n = self.drain_and_merge();
        if n == 0 {
            return 0;
        }

        let events = std::mem::take(&mut self.free_event_scratch);
        for event in events.iter().copied() {
            self.dispatch_one(event, on_builtin_rx, on_disconnect);
        }
        self.free_event_scratch = events;

        n
    }

    fn dispatch_one(
        &mut self,
        event: SessionEvent,
        on_builtin_rx: &mut dyn FnMut(u32, u32),
        on_disconnect: &mut dyn FnMut(u32),
    ) {
        match event {
            SessionEvent::Tx { session_index } => self.dispatch_tx(session_index, event),
            SessionEvent::Disconnect { session_index, postponed } => {
                self.dispatch_disconnect(session_index, postponed, on_disconnect);
            }
            SessionEvent::BuiltinRx { session_index } => {
                self.tx_builtin(session_index, on_builtin_rx);
            }
            SessionEvent::Rpc { f, arg } => f(arg),
            SessionEvent::AppRx { .. } => {
                // Owned by a different node in the full system; intentionally a no-op.
            }
        }
    }

    fn dispatch_tx(&mut self, session_index: u32, event: SessionEvent) {
        if self.n_tx_packets_this_tick >= self.config.frame_size {
            self.pending_events.push(event);
            return;
        }

        if self.sessions.get(session_index).is_none() {
            warn!(session_index, "tx event references a session that no longer exists, dropping");
            return;
        }

        let outcome = match self.transport.tx_type() {
            TxType::Stream => self.tx_peek_and_send(session_index),
            TxType::Dgram => self.tx_dequeue_and_send(session_index),
        };

        match outcome {
            TxOutcome::Deferred => self.pending_events.push(event),
            TxOutcome::Dropped | TxOutcome::Sent => {}
        }
    }

    fn dispatch_disconnect(
        &mut self,
        session_index: u32,
        postponed: bool,
        on_disconnect: &mut dyn FnMut(u32),
    ) {
        if !postponed {
            // Forces this disconnect to be re-examined next tick, after any
            // TX events for the same session drained in this same batch.
            self.pending_disconnects.push(SessionEvent::Disconnect { session_index, postponed: true });
            return;
        }

        let Some(session) = self.sessions.get(session_index) else {
            warn!(session_index, "disconnect event references a session that no longer exists");
            return;
        };

        if session.tx_fifo.readable_bytes() > 0 {
            self.pending_disconnects.push(SessionEvent::Disconnect { session_index, postponed: true });
            return;
        }

        on_disconnect(session_index);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use mio::Token;

    use super::*;
    use crate::{
        buffer::HeapBufferPool,
        config::EngineConfig,
        fifo::SessionFifo,
        pipeline::ChannelSink,
        session::{AddressFamily, SessionState, SessionType, StreamSession},
        transport::TcpTxTransport,
    };

    fn connected_pair() -> (mio::net::TcpStream, mio::net::TcpStream) {
        use std::net::{TcpListener, TcpStream as StdStream};
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(server), mio::net::TcpStream::from_std(client))
    }

    fn test_engine() -> Engine<TcpTxTransport, HeapBufferPool, ChannelSink> {
        Engine::new(
            TcpTxTransport::new(),
            HeapBufferPool::new(2048, 128),
            ChannelSink::new(64),
            EngineConfig::default().with_frame_size(256),
        )
    }

    fn register_ready_session(
        engine: &mut Engine<TcpTxTransport, HeapBufferPool, ChannelSink>,
        session_index: u32,
    ) -> SocketAddr {
        let (server, _client) = connected_pair();
        let local = server.local_addr().unwrap();
        engine.transport.register(session_index, server, Token(session_index as usize), 1460, 65536, false);

        let session = StreamSession::new(
            session_index,
            0,
            SessionType { proto: TxType::Stream, family: AddressFamily::Ip4 },
            session_index,
            SessionFifo::new_heap(4096),
            SessionFifo::new_heap(16384),
            0,
        );
        let mut session = session;
        session.state = SessionState::Ready;
        engine.sessions.insert(session);
        local
    }

    #[test]
    fn tx_event_drains_fifo_into_next_node() {
        let mut engine = test_engine();
        register_ready_session(&mut engine, 1);
        engine.sessions.get(1).unwrap().tx_fifo.enqueue(&vec![5u8; 100]);

        engine.mailbox.try_push(SessionEvent::Tx { session_index: 1 });
        let n = engine.run_tick(&mut |_, _| {}, &mut |_| {});
        assert_eq!(n, 1);
        assert_eq!(engine.next_node.len(), 1);
        assert_eq!(engine.counters.snapshot().tx, 1);
    }

    #[test]
    fn unknown_session_tx_event_is_dropped_silently() {
        let mut engine = test_engine();
        engine.mailbox.try_push(SessionEvent::Tx { session_index: 42 });
        let n = engine.run_tick(&mut |_, _| {}, &mut |_| {});
        assert_eq!(n, 1);
        assert_eq!(engine.next_node.len(), 0);
        assert!(engine.pending_events.is_empty());
    }

    #[test]
    fn frame_budget_defers_extra_tx_events_to_next_tick() {
        let mut engine = test_engine();
        engine.config.frame_size = 1;
        register_ready_session(&mut engine, 1);
        register_ready_session(&mut engine, 2);
        engine.sessions.get(1).unwrap().tx_fifo.enqueue(&vec![1u8; 10]);
        engine.sessions.get(2).unwrap().tx_fifo.enqueue(&vec![2u8; 10]);

        engine.mailbox.try_push(SessionEvent::Tx { session_index: 1 });
        engine.mailbox.try_push(SessionEvent::Tx { session_index: 2 });
        engine.run_tick(&mut |_, _| {}, &mut |_| {});

        assert_eq!(engine.next_node.len(), 1);
        assert_eq!(engine.pending_events.len(), 1);
    }

    #[test]
    fn disconnect_is_postponed_one_tick_after_tx() {
        let mut engine = test_engine();
        register_ready_session(&mut engine, 1);
        engine.sessions.get(1).unwrap().tx_fifo.enqueue(&vec![1u8; 10]);

        engine.mailbox.try_push(SessionEvent::Tx { session_index: 1 });
        engine.mailbox.try_push(SessionEvent::Disconnect { session_index: 1, postponed: false });

        let mut disconnected = Vec::new();
        engine.run_tick(&mut |_, _| {}, &mut |s| disconnected.push(s));
        assert!(disconnected.is_empty());
        assert_eq!(engine.pending_disconnects.len(), 1);

        let fifo = engine.sessions.get(1).unwrap().tx_fifo;
        engine.transport.on_ack(1, 10, &fifo);

        engine.run_tick(&mut |_, _| {}, &mut |s| disconnected.push(s));
        assert_eq!(disconnected, vec![1]);
    }

    #[test]
    fn rpc_event_invokes_function_pointer() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static HIT: AtomicU32 = AtomicU32::new(0);
        extern "C" fn bump(_arg: *mut u8) {
            HIT.fetch_add(1, Ordering::SeqCst);
        }

        let mut engine = test_engine();
        engine.mailbox.try_push(SessionEvent::Rpc { f: bump, arg: std::ptr::null_mut() });
        engine.run_tick(&mut |_, _| {}, &mut |_| {});
        assert_eq!(HIT.load(Ordering::SeqCst), 1);
    }
}
