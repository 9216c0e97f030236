//! The session-facing data the engine reads and mutates each tick. Session
//! creation/destruction and the application-facing API around a session are
//! owned elsewhere; this crate only ever looks sessions up by index.

use crate::fifo::SessionFifo;
use crate::transport::TxType;

/// A session's lifecycle state. `Ready` is the only state from which the
/// peek-mode (stream) TX path proceeds; `Listening` is the dequeue-mode
/// (datagram) counterpart. The readiness gate in `pipeline.rs` matches on
/// this explicitly rather than comparing it as an ordered scale.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SessionState {
    Created,
    Connecting,
    Listening,
    Ready,
    Closed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddressFamily {
    Ip4,
    Ip6,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionType {
    pub proto: TxType,
    pub family: AddressFamily,
}

pub struct StreamSession {
    pub session_index: u32,
    pub thread_index: u16,
    pub session_type: SessionType,
    pub state: SessionState,
    pub connection_index: u32,
    pub rx_fifo: SessionFifo,
    pub tx_fifo: SessionFifo,
    pub app_index: u32,
}

impl StreamSession {
    pub fn new(
        session_index: u32,
        thread_index: u16,
        session_type: SessionType,
        connection_index: u32,
        rx_fifo: SessionFifo,
        tx_fifo: SessionFifo,
        app_index: u32,
    ) -> Self {
        Self {
            session_index,
            thread_index,
            session_type,
            state: SessionState::Created,
            connection_index,
            rx_fifo,
            tx_fifo,
            app_index,
        }
    }
}

/// Dense, per-thread table of live sessions, indexed by `session_index`.
/// Mirrors how the VPP source indexes `session_t` in a per-thread pool; here
/// it's just a sparse `Vec` since the engine never allocates indices itself.
#[derive(Default)]
pub struct SessionTable {
    sessions: Vec<Option<StreamSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: StreamSession) {
        let idx = session.session_index as usize;
        if idx >= self.sessions.len() {
            self.sessions.resize_with(idx + 1, || None);
        }
        self.sessions[idx] = Some(session);
    }

    pub fn remove(&mut self, session_index: u32) -> Option<StreamSession> {
        self.sessions.get_mut(session_index as usize).and_then(Option::take)
    }

    pub fn get(&self, session_index: u32) -> Option<&StreamSession> {
        self.sessions.get(session_index as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, session_index: u32) -> Option<&mut StreamSession> {
        self.sessions.get_mut(session_index as usize).and_then(Option::as_mut)
    }
}
