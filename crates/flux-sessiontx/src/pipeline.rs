//! The TX pipeline: turns bytes sitting in a session's tx fifo into buffer
//! chains handed to the next processing node. This is the hot path — the
//! rest of the engine exists to keep this function fed and bounded.

use std::collections::VecDeque;

use tracing::warn;

use crate::{
    buffer::{BufferFlags, BufferHandle, BufferPool},
    datagram::{self, DgramPreHeader, HDR_LEN},
    engine::Engine,
    event::SessionEvent,
    fifo::SessionFifo,
    session::SessionState,
    transport::{TxTransport, TxType},
};

/// Result of a single TX event handed back to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    /// Emitted everything it could this tick (possibly zero bytes, if
    /// there was nothing new to send — the fifo-relative-to-offset empty
    /// case counts as success, not a no-op error).
    Sent,
    /// Could not make progress; caller should push the event back onto the
    /// pending queue.
    Deferred,
    /// Event is permanently unactionable (dead session, closed session in
    /// peek mode); caller should drop it without retrying.
    Dropped,
}

/// The downstream hand-off: equivalent to `get_next_frame`/`put_next_frame`
/// against the next processing node's input ring.
pub trait NextNodeSink: Send {
    /// Free slots in the next node's current frame.
    fn free_slots(&self) -> usize;
    /// Publishes one (possibly chained) buffer to the next node. Ownership
    /// of the chain transfers to the sink.
    fn push(&mut self, head: BufferHandle);
}

/// In-process bounded sink used by tests and single-process deployments.
pub struct ChannelSink {
    capacity: usize,
    queue: VecDeque<BufferHandle>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, queue: VecDeque::new() }
    }

    /// Drains everything published so far, in publish order.
    pub fn drain(&mut self) -> Vec<BufferHandle> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl NextNodeSink for ChannelSink {
    fn free_slots(&self) -> usize {
        self.capacity - self.queue.len()
    }

    fn push(&mut self, head: BufferHandle) {
        debug_assert!(self.queue.len() < self.capacity, "pushed past next-node frame capacity");
        self.queue.push_back(head);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadinessOutcome {
    Proceed,
    Defer,
    Fatal,
}

/// `state < READY` defers; `state == CLOSED` in peek mode is fatal (the
/// event is dropped, not retried) since a closed session's stream fifo
/// will never become sendable again. Dequeue mode (datagram sessions)
/// ignores state entirely — a `LISTENING` dgram session can send
/// unconnected datagrams.
fn readiness_gate(state: SessionState, peek_mode: bool) -> ReadinessOutcome {
    if !peek_mode {
        return ReadinessOutcome::Proceed;
    }
    match state {
        SessionState::Closed => ReadinessOutcome::Fatal,
        SessionState::Ready => ReadinessOutcome::Proceed,
        SessionState::Created | SessionState::Connecting | SessionState::Listening => {
            ReadinessOutcome::Defer
        }
    }
}

/// Output of the batch-sizing step (`spec` §4.3.3), pure and independent of
/// any session/transport state so it's cheap to unit test directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizingResult {
    pub max_dequeue: u32,
    pub max_len_to_snd: u32,
    pub n_segs_per_evt: u32,
    pub n_bufs_per_seg: u32,
    pub deq_per_first_buf: usize,
    pub deq_per_buf: usize,
    pub dgram_hdr: Option<DgramPreHeader>,
}

/// Computes how many bytes/segments/buffers this TX event should move,
/// bounded by MSS, send window, frame budget, and buffer geometry. Returns
/// `None` when there's nothing new to send (not an error — callers should
/// treat it as a successful no-op).
#[allow(clippy::too_many_arguments)]
pub fn set_dequeue_params(
    fifo: &SessionFifo,
    peek_mode: bool,
    tx_type: TxType,
    tx_offset: u32,
    snd_mss: u16,
    snd_space: u32,
    max_segs: u32,
    buffer_size: usize,
    headroom: usize,
) -> Option<SizingResult> {
    if max_segs == 0 || snd_mss == 0 {
        return None;
    }

    let readable = fifo.readable_bytes();
    let mut dgram_hdr = None;

    let max_dequeue = if peek_mode {
        if tx_offset >= readable {
            return None;
        }
        readable - tx_offset
    } else if tx_type == TxType::Dgram {
        let hdr = datagram::peek_header(fifo)?;
        let remaining = hdr.remaining();
        dgram_hdr = Some(hdr);
        remaining
    } else {
        readable
    };

    if max_dequeue == 0 {
        return None;
    }

    let snd_mss_u32 = u32::from(snd_mss);
    let mut max_len_to_snd = if max_dequeue < snd_space {
        if max_dequeue > snd_mss_u32 { (max_dequeue / snd_mss_u32) * snd_mss_u32 } else { max_dequeue }
    } else {
        snd_space
    };

    if max_len_to_snd == 0 {
        return None;
    }

    let mut n_segs_per_evt = max_len_to_snd.div_ceil(snd_mss_u32);
    if n_segs_per_evt > max_segs {
        n_segs_per_evt = max_segs;
        max_len_to_snd = n_segs_per_evt * snd_mss_u32;
    }

    let n_bufs_per_seg = (headroom as u32 + snd_mss_u32).div_ceil(buffer_size as u32).max(1);
    let deq_per_first_buf = (snd_mss as usize).min(buffer_size.saturating_sub(headroom));
    let deq_per_buf = (snd_mss as usize).min(buffer_size);

    Some(SizingResult {
        max_dequeue,
        max_len_to_snd,
        n_segs_per_evt,
        n_bufs_per_seg,
        deq_per_first_buf,
        deq_per_buf,
        dgram_hdr,
    })
}

#[inline(always)]
fn prefetch_read(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use core::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch(ptr.cast::<i8>(), _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
    }
}

/// One read cursor into a session's tx fifo, abstracting over the three
/// ways bytes get copied out (`spec` §4.3.5 step 4).
enum TxSource {
    /// Stream retransmit: non-destructive, advances a local offset.
    Peek { offset: u32 },
    /// Plain stream dequeue: destructive, fifo tracks its own cursor.
    DequeueStream,
    /// Datagram dequeue: non-destructive peek past the pre-header,
    /// advancing `data_offset` in place.
    DequeueDgram { hdr: DgramPreHeader },
}

impl TxSource {
    fn copy_into(&mut self, fifo: &SessionFifo, out: &mut [u8]) -> u32 {
        match self {
            TxSource::Peek { offset } => {
                let n = fifo.peek(*offset, out);
                *offset += n;
                n
            }
            TxSource::DequeueStream => fifo.dequeue(out),
            TxSource::DequeueDgram { hdr } => {
                let n = fifo.peek(hdr.data_offset + HDR_LEN as u32, out);
                hdr.data_offset += n;
                n
            }
        }
    }
}

impl<T: TxTransport, B: BufferPool, N: NextNodeSink> Engine<T, B, N> {
    /// Peek-mode (retransmit-capable) TX path, used by stream transports.
    pub fn tx_peek_and_send(&mut self, session_index: u32) -> TxOutcome {
        self.tx_send(session_index, true)
    }

    /// Dequeue-mode TX path, used by transports that don't retain sent
    /// bytes (plain stream dequeue, or datagram framing).
    pub fn tx_dequeue_and_send(&mut self, session_index: u32) -> TxOutcome {
        self.tx_send(session_index, false)
    }

    /// Hands the session to the app's builtin TX callback, having cleared
    /// the RX event flag. The callback itself lives outside this crate;
    /// `on_builtin_rx` is the hook a caller wires up.
    pub fn tx_builtin(
        &mut self,
        session_index: u32,
        on_builtin_rx: &mut dyn FnMut(u32, u32),
    ) -> TxOutcome {
        let Some(session) = self.sessions.get(session_index) else {
            warn!(session_index, "builtin-rx event for unknown session, dropping");
            return TxOutcome::Dropped;
        };
        session.rx_fifo.unset_event();
        on_builtin_rx(session_index, session.app_index);
        TxOutcome::Sent
    }

    fn tx_send(&mut self, session_index: u32, peek_mode: bool) -> TxOutcome {
        let Some(session) = self.sessions.get(session_index) else {
            warn!(session_index, "tx event for unknown session, dropping");
            return TxOutcome::Dropped;
        };
        let state = session.state;
        let connection_index = session.connection_index;
        let thread_index = session.thread_index;
        let tx_fifo: SessionFifo = session.tx_fifo;

        match readiness_gate(state, peek_mode) {
            ReadinessOutcome::Fatal => return TxOutcome::Dropped,
            ReadinessOutcome::Defer => return TxOutcome::Deferred,
            ReadinessOutcome::Proceed => {}
        }

        let tx_type = self.transport.tx_type();
        let is_listening = state == SessionState::Listening;

        let conn = if peek_mode || !is_listening {
            self.transport.get_connection(connection_index, thread_index)
        } else {
            self.transport.get_listener(connection_index)
        };
        let Some(conn) = conn else {
            warn!(session_index, "tx event: no transport connection for session, dropping");
            return TxOutcome::Dropped;
        };

        let snd_mss = self.transport.send_mss(conn);
        let snd_space = self.transport.send_space(conn);
        if snd_mss == 0 || snd_space == 0 {
            return TxOutcome::Deferred;
        }

        // New data arriving during this tick re-arms notification.
        tx_fifo.unset_event();

        let tx_offset = if peek_mode { self.transport.tx_fifo_offset(conn) } else { 0 };
        let max_segs = self.config.frame_size.saturating_sub(self.n_tx_packets_this_tick);

        let Some(sizing) = set_dequeue_params(
            &tx_fifo,
            peek_mode,
            tx_type,
            tx_offset,
            snd_mss,
            snd_space,
            max_segs,
            self.buffer_pool.buffer_size(),
            self.buffer_pool.headroom(),
        ) else {
            return TxOutcome::Sent;
        };

        let n_bufs_needed = (sizing.n_segs_per_evt * sizing.n_bufs_per_seg) as usize;
        if self.tx_buffers.len() < n_bufs_needed {
            let shortfall = n_bufs_needed - self.tx_buffers.len();
            self.buffer_pool.alloc_bulk(&mut self.tx_buffers, shortfall);
        }
        if self.tx_buffers.len() < n_bufs_needed {
            self.counters.inc_no_buffer();
            return TxOutcome::Deferred;
        }

        let mut n_segs = sizing.n_segs_per_evt;
        let mut max_len_to_snd = sizing.max_len_to_snd;
        let free_slots = self.next_node.free_slots() as u32;
        if free_slots < n_segs {
            n_segs = free_slots;
            max_len_to_snd = n_segs * u32::from(snd_mss);
        }

        let mut source = match (peek_mode, tx_type) {
            (true, _) => TxSource::Peek { offset: tx_offset },
            (false, TxType::Dgram) => {
                TxSource::DequeueDgram { hdr: sizing.dgram_hdr.expect("dgram sizing always peeks a header") }
            }
            (false, TxType::Stream) => TxSource::DequeueStream,
        };

        if is_listening && tx_type == TxType::Dgram {
            if let TxSource::DequeueDgram { hdr } = &source {
                self.transport.set_remote(conn, hdr.remote);
            }
        }

        let mut left_to_snd = max_len_to_snd;
        let snd_mss_u32 = u32::from(snd_mss);

        for seg_idx in 0..n_segs {
            if n_segs - seg_idx >= 4
                && let Some(&next_buf) = self.tx_buffers.last()
            {
                prefetch_read((self.buffer_pool.get(next_buf) as *const _) as *const u8);
            }

            let seg_total = left_to_snd.min(snd_mss_u32);
            let head = self.tx_buffers.pop().expect("provisioned enough buffers above");
            self.buffer_pool.get_mut(head).flags = BufferFlags::LOCALLY_ORIGINATED;

            let len_first = (seg_total as usize).min(sizing.deq_per_first_buf);
            {
                let buf = self.buffer_pool.get_mut(head);
                let n = source.copy_into(&tx_fifo, buf.payload_mut(len_first));
                debug_assert_eq!(n as usize, len_first);
                buf.current_length = len_first;
            }
            left_to_snd -= len_first as u32;
            let mut seg_remaining = seg_total - len_first as u32;

            let mut tail = head;
            while seg_remaining > 0 {
                let next = self.tx_buffers.pop().expect("provisioned enough buffers above");
                self.buffer_pool.get_mut(next).flags = BufferFlags::LOCALLY_ORIGINATED;
                self.buffer_pool.get_mut(next).current_data = 0;

                let len = (seg_remaining as usize).min(sizing.deq_per_buf);
                {
                    let buf = self.buffer_pool.get_mut(next);
                    let n = source.copy_into(&tx_fifo, buf.payload_mut(len));
                    debug_assert_eq!(n as usize, len);
                    buf.current_length = len;
                }

                self.buffer_pool.get_mut(tail).next_buffer = Some(next);
                self.buffer_pool.get_mut(tail).flags |= BufferFlags::NEXT_PRESENT;
                self.buffer_pool.get_mut(head).total_length_not_including_first_buffer += len as u32;

                left_to_snd -= len as u32;
                seg_remaining -= len as u32;
                tail = next;
            }

            self.transport.push_header(conn, &mut self.buffer_pool, head);
            self.next_node.push(head);
        }

        debug_assert_eq!(left_to_snd, 0, "tx event must fully account for max_len_to_snd");
        self.n_tx_packets_this_tick += n_segs;
        self.counters.add_tx(u64::from(n_segs));

        let mut more_data = false;
        match (&source, tx_type) {
            (TxSource::DequeueDgram { hdr }, TxType::Dgram) => {
                if hdr.is_complete() {
                    datagram::drop_datagram(&tx_fifo, hdr);
                    if tx_fifo.readable_bytes() > 0 {
                        more_data = true;
                    }
                } else {
                    datagram::write_back(&tx_fifo, hdr);
                    more_data = true;
                }
            }
            _ => {
                if max_len_to_snd < sizing.max_dequeue {
                    more_data = true;
                }
            }
        }

        if more_data && tx_fifo.set_event() {
            self.pending_events.push(SessionEvent::Tx { session_index });
        }

        TxOutcome::Sent
    }
}
