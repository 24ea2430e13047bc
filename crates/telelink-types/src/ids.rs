//! Local and wire identifiers for message types and senders.
//!
//! User ids are non-negative and assigned in registration order. Negative
//! type ids are reserved for system messages; `-1` is the wildcard used when
//! registering handlers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageTypeId(pub i32);

impl MessageTypeId {
    /// Wildcard: matches every user message type in a handler registration.
    pub const ANY: Self = Self(-1);

    /// True for ids handed out by a name registry.
    pub fn is_user(self) -> bool {
        self.0 >= 0
    }

    /// True for reserved system message types.
    pub fn is_system(self) -> bool {
        self.0 < -1
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a sender (a named device or service on one host).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderId(pub i32);

impl SenderId {
    /// Wildcard: matches every sender in a handler registration.
    pub const ANY: Self = Self(-1);

    /// Sender attached to events the transport generates itself
    /// (connection events, protocol error reports).
    pub const CONTROL: Self = Self(-2);

    pub fn is_user(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved system message types.
///
/// The numeric values are part of the wire format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemType {
    SenderDescription,
    TypeDescription,
    UdpDescription,
    LogDescription,
    TextMessage,
    GotConnection,
    GotFirstConnection,
    DroppedConnection,
    DroppedLastConnection,
    Ping,
    Pong,
}

impl SystemType {
    pub const ALL: [SystemType; 11] = [
        SystemType::SenderDescription,
        SystemType::TypeDescription,
        SystemType::UdpDescription,
        SystemType::LogDescription,
        SystemType::TextMessage,
        SystemType::GotConnection,
        SystemType::GotFirstConnection,
        SystemType::DroppedConnection,
        SystemType::DroppedLastConnection,
        SystemType::Ping,
        SystemType::Pong,
    ];

    /// The reserved type id for this system message.
    pub const fn id(self) -> MessageTypeId {
        MessageTypeId(match self {
            SystemType::SenderDescription => -2,
            SystemType::TypeDescription => -3,
            SystemType::UdpDescription => -4,
            SystemType::LogDescription => -5,
            SystemType::TextMessage => -6,
            SystemType::GotConnection => -7,
            SystemType::GotFirstConnection => -8,
            SystemType::DroppedConnection => -9,
            SystemType::DroppedLastConnection => -10,
            SystemType::Ping => -11,
            SystemType::Pong => -12,
        })
    }

    pub fn from_id(id: MessageTypeId) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    pub fn is_description(self) -> bool {
        matches!(
            self,
            SystemType::SenderDescription | SystemType::TypeDescription
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_ids_round_trip() {
        for t in SystemType::ALL {
            assert!(t.id().is_system());
            assert_eq!(SystemType::from_id(t.id()), Some(t));
        }
    }

    #[test]
    fn test_system_ids_unique() {
        let mut ids: Vec<i32> = SystemType::ALL.iter().map(|t| t.id().0).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), SystemType::ALL.len());
    }

    #[test]
    fn test_wildcards_are_not_user_or_system() {
        assert!(!MessageTypeId::ANY.is_user());
        assert!(!MessageTypeId::ANY.is_system());
        assert!(!SenderId::ANY.is_user());
        assert_eq!(SystemType::from_id(MessageTypeId::ANY), None);
        assert_eq!(SystemType::from_id(MessageTypeId(0)), None);
    }
}
