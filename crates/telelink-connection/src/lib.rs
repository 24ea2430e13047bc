//! Telelink connection layer.
//!
//! Applications open a [`Connection`] (server, client or log replay),
//! register sender and type names, attach handlers and call
//! [`Connection::pump`] regularly. Everything the connection does happens
//! inside `send` and `pump`; there are no background tasks.
//!
//! ## Layout
//!
//! - **registry**: local name tables and per-peer id translation
//! - **dispatch**: handler table with guard-based removal
//! - **channel**: the reliable stream and the datagram socket of one peer
//! - **peer**: one peer link with its handshake state
//! - **clock**: ping/pong round trips and liveness
//! - **logger** / **replay**: recording traffic and playing it back
//! - **worker**: counting semaphore and a worker thread for blocking work

pub mod channel;
pub mod clock;
pub mod connection;
pub mod dispatch;
pub mod logger;
pub mod peer;
pub mod registry;
pub mod replay;
pub mod target;
pub mod worker;

pub use clock::RoundTrip;
pub use connection::{Connection, ConnectionStatus, MessageSender};
pub use dispatch::HandlerGuard;
pub use logger::{read_log, FileLogger, FilterVerdict, LogEntry};
pub use peer::{LinkPhase, LinkStats, PeerInfo};
pub use registry::{NameRegistry, Registration, TranslationTable};
pub use replay::{LogReplay, ReplayController, ReplayState};
pub use target::Target;
pub use worker::{Semaphore, WorkerThread};
