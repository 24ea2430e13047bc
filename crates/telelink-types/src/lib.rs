//! Core types shared by every telelink crate.
//!
//! This crate defines the data model of the transport (ids, messages,
//! timestamps), the error taxonomy and the serde-backed configuration. It has
//! no networking code of its own.

pub mod config;
pub mod error;
pub mod ids;
pub mod message;

pub use config::{LogConfig, LogMode, TransportConfig};
pub use error::{CodecError, HandlerError, IdKind, TransportError, TransportResult};
pub use ids::{MessageTypeId, SenderId, SystemType};
pub use message::{DeliveryClass, Message, Scope, TextSeverity, TimeVal};
