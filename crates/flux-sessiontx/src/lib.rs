//! Session TX dispatch engine.
//!
//! Per worker thread, drains pending session events (transmit requests,
//! builtin-receive deliveries, disconnects, deferred RPCs) and, for
//! transmit events, turns bytes queued in per-session fifos into transport
//! packet buffers handed to a downstream node. See `engine::Engine` for the
//! entry point and `pipeline` for the hot-path sizing/copy logic.

pub mod buffer;
pub mod config;
pub mod counters;
pub mod datagram;
pub mod dispatcher;
pub mod dump;
pub mod engine;
pub mod error;
pub mod event;
pub mod fifo;
pub mod mailbox;
pub mod periodic;
pub mod pipeline;
pub mod session;
pub mod transport;

pub use buffer::{BufferHandle, BufferPool, HeapBufferPool, TxBuffer};
pub use config::EngineConfig;
pub use counters::{EngineCounters, EngineCountersSnapshot};
pub use datagram::{DgramPreHeader, HDR_LEN};
pub use engine::Engine;
pub use error::SessionTxError;
pub use event::SessionEvent;
pub use fifo::SessionFifo;
pub use mailbox::EventMailbox;
pub use periodic::PeriodicProcess;
pub use pipeline::{ChannelSink, NextNodeSink, TxOutcome};
pub use session::{AddressFamily, SessionState, SessionTable, SessionType, StreamSession};
pub use transport::{TcpTxTransport, TxTransport, TxType};
