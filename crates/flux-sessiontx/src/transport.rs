//! The transport vtable the engine pulls connection/window parameters from
//! and hands header-pushing responsibility to. One real binding
//! (`TcpTxTransport`) is provided, adapted from `flux_network::tcp`'s
//! non-blocking connection bookkeeping (mio tokens, a slab of live
//! connections) but reshaped around header push rather than whole-message
//! framing, since that's what sits under this engine in the stack.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};

use mio::{Token, net::TcpStream};

use crate::{
    buffer::{BufferHandle, BufferPool},
    fifo::SessionFifo,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxType {
    Stream,
    Dgram,
}

/// The set of operations the engine needs from a transport protocol to turn
/// fifo bytes into wire-ready buffer chains. `Connection` is a small, copyable
/// handle into whatever connection table the transport keeps; the engine
/// never inspects its contents.
pub trait TxTransport: Send {
    type Connection: Copy;

    fn tx_type(&self) -> TxType;

    /// Resolves a session's connection for the peek-mode (retransmit-capable)
    /// path, or the plain dequeue-stream path on an established connection.
    fn get_connection(&mut self, connection_index: u32, thread_index: u16) -> Option<Self::Connection>;

    /// Resolves the listener backing a listening dgram session (dequeue
    /// mode, `LISTENING` state).
    fn get_listener(&mut self, connection_index: u32) -> Option<Self::Connection>;

    /// Maximum segment size the connection can currently send in one
    /// packet. Zero means the connection can't be written to right now.
    fn send_mss(&self, conn: Self::Connection) -> u16;

    /// Remaining send window, in bytes. Zero means backpressured.
    fn send_space(&self, conn: Self::Connection) -> u32;

    /// Byte offset into the tx fifo the transport has already sent but not
    /// yet had acknowledged (peek mode only — always 0 in dequeue mode).
    fn tx_fifo_offset(&self, conn: Self::Connection) -> u32;

    /// For a listening dgram connection, binds the outgoing datagram's
    /// destination before the header is pushed.
    fn set_remote(&mut self, conn: Self::Connection, remote: SocketAddr);

    /// Prepends the transport's wire header into the head buffer's reserved
    /// headroom, given the buffer's now-final payload length.
    fn push_header(&mut self, conn: Self::Connection, pool: &mut dyn BufferPool, head: BufferHandle);
}

#[derive(Clone, Copy, Debug)]
pub struct TcpConnHandle(u32);

struct TcpConnState {
    stream: TcpStream,
    token: Token,
    snd_mss: u16,
    snd_space: AtomicU32,
    /// Bytes sent but not yet acknowledged; the retransmit offset peek mode
    /// resumes reading from.
    snd_nxt: AtomicU32,
    is_listener: bool,
}

/// TCP stream-mode transport. Connections are looked up by the session's
/// `connection_index`, which this transport treats as an index into its own
/// slab (distinct from the mio `Token` used for poll registration).
pub struct TcpTxTransport {
    conns: HashMap<u32, TcpConnState>,
    next_seq: HashMap<u32, u32>,
}

impl TcpTxTransport {
    pub fn new() -> Self {
        Self { conns: HashMap::new(), next_seq: HashMap::new() }
    }

    /// Registers an already-connected (or listening) socket under
    /// `connection_index`, as the session layer would after `accept`/`connect`
    /// completes. `snd_mss` and initial `snd_space` model what a real TCP
    /// stack would read back from the kernel (path MTU, advertised window).
    pub fn register(
        &mut self,
        connection_index: u32,
        stream: TcpStream,
        token: Token,
        snd_mss: u16,
        snd_space: u32,
        is_listener: bool,
    ) {
        stream.set_nodelay(true).ok();
        self.conns.insert(
            connection_index,
            TcpConnState {
                stream,
                token,
                snd_mss,
                snd_space: AtomicU32::new(snd_space),
                snd_nxt: AtomicU32::new(0),
                is_listener,
            },
        );
    }

    /// Called when the connection's peer acks `n` more bytes: opens up the
    /// send window, pulls the retransmit offset back by the acked amount
    /// (those bytes no longer need to be peeked again), and drops them from
    /// the session's tx fifo for good.
    pub fn on_ack(&self, connection_index: u32, n: u32, fifo: &SessionFifo) {
        if let Some(c) = self.conns.get(&connection_index) {
            c.snd_space.fetch_add(n, Ordering::AcqRel);
            c.snd_nxt.fetch_sub(n, Ordering::AcqRel);
            fifo.dequeue_drop(n);
        }
    }

    /// Rewinds the retransmit offset to the start of the fifo, as a
    /// retransmit timeout would: the next peek-mode send re-reads everything
    /// still unacknowledged from byte 0.
    pub fn reset_tx_offset(&self, connection_index: u32) {
        if let Some(c) = self.conns.get(&connection_index) {
            c.snd_nxt.store(0, Ordering::Release);
        }
    }

    pub fn set_send_space(&self, connection_index: u32, space: u32) {
        if let Some(c) = self.conns.get(&connection_index) {
            c.snd_space.store(space, Ordering::Release);
        }
    }

    pub fn remove(&mut self, connection_index: u32) {
        self.conns.remove(&connection_index);
        self.next_seq.remove(&connection_index);
    }

    pub fn token_of(&self, connection_index: u32) -> Option<Token> {
        self.conns.get(&connection_index).map(|c| c.token)
    }
}

impl Default for TcpTxTransport {
    fn default() -> Self {
        Self::new()
    }
}

const TCP_HEADER_LEN: usize = 8;

impl TxTransport for TcpTxTransport {
    type Connection = TcpConnHandle;

    fn tx_type(&self) -> TxType {
        TxType::Stream
    }

    fn get_connection(&mut self, connection_index: u32, _thread_index: u16) -> Option<Self::Connection> {
        self.conns.contains_key(&connection_index).then_some(TcpConnHandle(connection_index))
    }

    fn get_listener(&mut self, connection_index: u32) -> Option<Self::Connection> {
        self.conns
            .get(&connection_index)
            .filter(|c| c.is_listener)
            .map(|_| TcpConnHandle(connection_index))
    }

    fn send_mss(&self, conn: Self::Connection) -> u16 {
        self.conns.get(&conn.0).map_or(0, |c| c.snd_mss)
    }

    fn send_space(&self, conn: Self::Connection) -> u32 {
        self.conns.get(&conn.0).map_or(0, |c| c.snd_space.load(Ordering::Acquire))
    }

    fn tx_fifo_offset(&self, conn: Self::Connection) -> u32 {
        self.conns.get(&conn.0).map_or(0, |c| c.snd_nxt.load(Ordering::Acquire))
    }

    fn set_remote(&mut self, _conn: Self::Connection, _remote: SocketAddr) {
        // stream mode has a fixed peer set at connect/accept time
    }

    fn push_header(&mut self, conn: Self::Connection, pool: &mut dyn BufferPool, head: BufferHandle) {
        let payload_len = pool.get(head).total_length();
        let seq = self.next_seq.entry(conn.0).or_insert(0);
        let hdr_start = pool.get(head).current_data - TCP_HEADER_LEN;
        {
            let buf = pool.get_mut(head);
            let hdr = buf.raw_mut_range(hdr_start, TCP_HEADER_LEN);
            hdr[0..4].copy_from_slice(&payload_len.to_le_bytes());
            hdr[4..8].copy_from_slice(&seq.to_le_bytes());
            buf.current_data = hdr_start;
            buf.current_length += TCP_HEADER_LEN;
        }
        *seq = seq.wrapping_add(payload_len);
        if let Some(c) = self.conns.get(&conn.0) {
            c.snd_nxt.fetch_add(payload_len, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HeapBufferPool;

    #[test]
    fn unregistered_connection_resolves_to_none() {
        let mut t = TcpTxTransport::new();
        assert!(t.get_connection(1, 0).is_none());
    }

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

    #[test]
    fn registered_connection_reports_mss_and_space() {
        let (server, _client) = connected_pair();
        let mut t = TcpTxTransport::new();
        t.register(7, server, Token(0), 1460, 65536, false);
        let conn = t.get_connection(7, 0).unwrap();
        assert_eq!(t.send_mss(conn), 1460);
        assert_eq!(t.send_space(conn), 65536);
        assert_eq!(t.tx_fifo_offset(conn), 0);
    }

    #[test]
    fn ack_advances_window_and_drains_fifo() {
        let (server, _client) = connected_pair();
        let mut t = TcpTxTransport::new();
        t.register(7, server, Token(0), 1460, 0, false);
        let conn = t.get_connection(7, 0).unwrap();

        let fifo = crate::fifo::SessionFifo::new_heap(2048);
        fifo.enqueue(&[7u8; 1000]);

        let mut pool = HeapBufferPool::new(1008, TCP_HEADER_LEN);
        let mut handles = Vec::new();
        pool.alloc_bulk(&mut handles, 1);
        pool.get_mut(handles[0]).current_length = 1000;
        t.push_header(conn, &mut pool, handles[0]);
        assert_eq!(t.tx_fifo_offset(conn), 1000);

        t.on_ack(7, 1000, &fifo);
        assert_eq!(t.send_space(conn), 1000);
        assert_eq!(t.tx_fifo_offset(conn), 0);
        assert_eq!(fifo.readable_bytes(), 0);
    }

    #[test]
    fn push_header_prepends_length_and_seq_into_headroom() {
        let (server, _client) = connected_pair();
        let mut t = TcpTxTransport::new();
        t.register(7, server, Token(0), 1460, 65536, false);
        let conn = t.get_connection(7, 0).unwrap();

        let mut pool = HeapBufferPool::new(64, TCP_HEADER_LEN);
        let mut handles = Vec::new();
        pool.alloc_bulk(&mut handles, 1);
        let head = handles[0];
        pool.get_mut(head).current_length = 10;

        t.push_header(conn, &mut pool, head);
        let buf = pool.get(head);
        assert_eq!(buf.current_data, 0);
        assert_eq!(buf.current_length, 18);
        assert_eq!(u32::from_le_bytes(buf.payload()[0..4].try_into().unwrap()), 10);
        assert_eq!(u32::from_le_bytes(buf.payload()[4..8].try_into().unwrap()), 0);
    }
}
