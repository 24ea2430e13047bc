//! Messages, timestamps and delivery options.

use crate::ids::{MessageTypeId, SenderId};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Wall-clock timestamp as carried on the wire: seconds plus microseconds.
///
/// `usec` is kept normalized to `0..1_000_000`, so the derived ordering is
/// chronological.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeVal {
    pub sec: i32,
    pub usec: i32,
}

impl TimeVal {
    pub fn new(sec: i32, usec: i32) -> Self {
        Self::from_micros(sec as i64 * MICROS_PER_SEC + usec as i64)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            sec: now.timestamp() as i32,
            usec: now.timestamp_subsec_micros() as i32,
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self {
            sec: micros.div_euclid(MICROS_PER_SEC) as i32,
            usec: micros.rem_euclid(MICROS_PER_SEC) as i32,
        }
    }

    pub fn as_micros(self) -> i64 {
        self.sec as i64 * MICROS_PER_SEC + self.usec as i64
    }

    /// Signed difference `self - earlier` in microseconds.
    pub fn micros_since(self, earlier: TimeVal) -> i64 {
        self.as_micros() - earlier.as_micros()
    }

    /// `self - earlier`, clamped at zero.
    pub fn saturating_duration_since(self, earlier: TimeVal) -> Duration {
        Duration::from_micros(self.micros_since(earlier).max(0) as u64)
    }
}

impl fmt::Display for TimeVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Which physical channel a message travels on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryClass {
    /// Ordered, retried stream delivery.
    #[default]
    Reliable,
    /// Best-effort datagram delivery. May be dropped or reordered.
    LowLatency,
}

/// Whether a message is forwarded to peers or only dispatched locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Any,
    LocalOnly,
}

/// Severity of a text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextSeverity {
    Normal,
    Warning,
    Error,
}

impl TextSeverity {
    pub fn as_u32(self) -> u32 {
        match self {
            TextSeverity::Normal => 0,
            TextSeverity::Warning => 1,
            TextSeverity::Error => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TextSeverity::Normal),
            1 => Some(TextSeverity::Warning),
            2 => Some(TextSeverity::Error),
            _ => None,
        }
    }
}

/// A typed, timestamped message.
///
/// Ids are always in the local id space of the process holding the message;
/// translation from a peer's ids happens before a message is built.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub type_id: MessageTypeId,
    pub sender: SenderId,
    pub timestamp: TimeVal,
    pub payload: Bytes,
    pub class: DeliveryClass,
    pub scope: Scope,
}

impl Message {
    /// A reliable, forwarded message stamped with the current time.
    pub fn new(type_id: MessageTypeId, sender: SenderId, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            sender,
            timestamp: TimeVal::now(),
            payload: payload.into(),
            class: DeliveryClass::Reliable,
            scope: Scope::Any,
        }
    }

    pub fn with_timestamp(mut self, timestamp: TimeVal) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_class(mut self, class: DeliveryClass) -> Self {
        self.class = class;
        self
    }

    pub fn local_only(mut self) -> Self {
        self.scope = Scope::LocalOnly;
        self
    }
}
