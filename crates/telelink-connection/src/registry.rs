//! Name registry and per-peer id translation.
//!
//! Each process hands out its own small integer ids for type and sender
//! names. Peers announce their ids with description messages; the
//! [`TranslationTable`] for that peer maps the announced ids to ours.

use std::collections::HashMap;
use telelink_types::{MessageTypeId, SenderId};

/// Outcome of registering a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration<I> {
    pub id: I,
    /// False if the name was already registered.
    pub is_new: bool,
}

/// Append-only name table. Ids are indices and are never reused.
#[derive(Debug, Default)]
struct NameTable {
    names: Vec<String>,
    index: HashMap<String, i32>,
}

impl NameTable {
    fn register(&mut self, name: &str) -> (i32, bool) {
        if let Some(&id) = self.index.get(name) {
            return (id, false);
        }
        let id = self.names.len() as i32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        (id, true)
    }

    fn id(&self, name: &str) -> Option<i32> {
        self.index.get(name).copied()
    }

    fn name(&self, id: i32) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as i32, n.as_str()))
    }
}

/// Local type and sender names of one connection.
#[derive(Debug, Default)]
pub struct NameRegistry {
    types: NameTable,
    senders: NameTable,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self, name: &str) -> Registration<MessageTypeId> {
        let (id, is_new) = self.types.register(name);
        Registration {
            id: MessageTypeId(id),
            is_new,
        }
    }

    pub fn register_sender(&mut self, name: &str) -> Registration<SenderId> {
        let (id, is_new) = self.senders.register(name);
        Registration {
            id: SenderId(id),
            is_new,
        }
    }

    pub fn type_id(&self, name: &str) -> Option<MessageTypeId> {
        self.types.id(name).map(MessageTypeId)
    }

    pub fn sender_id(&self, name: &str) -> Option<SenderId> {
        self.senders.id(name).map(SenderId)
    }

    pub fn type_name(&self, id: MessageTypeId) -> Option<&str> {
        self.types.name(id.0)
    }

    pub fn sender_name(&self, id: SenderId) -> Option<&str> {
        self.senders.name(id.0)
    }

    /// Types in registration order.
    pub fn types(&self) -> impl Iterator<Item = (MessageTypeId, &str)> {
        self.types.iter().map(|(id, n)| (MessageTypeId(id), n))
    }

    /// Senders in registration order.
    pub fn senders(&self) -> impl Iterator<Item = (SenderId, &str)> {
        self.senders.iter().map(|(id, n)| (SenderId(id), n))
    }
}

/// Map from one peer's ids to local ids, built from its descriptions.
///
/// Wildcards and reserved negative ids are passed through untouched; every
/// other id must have been described first.
#[derive(Debug, Default)]
pub struct TranslationTable {
    types: HashMap<i32, i32>,
    senders: HashMap<i32, i32>,
}

impl TranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's type description, registering the name locally if new.
    pub fn learn_type(
        &mut self,
        remote: MessageTypeId,
        name: &str,
        registry: &mut NameRegistry,
    ) -> Registration<MessageTypeId> {
        let reg = registry.register_type(name);
        self.types.insert(remote.0, reg.id.0);
        reg
    }

    /// Record a peer's sender description, registering the name locally if new.
    pub fn learn_sender(
        &mut self,
        remote: SenderId,
        name: &str,
        registry: &mut NameRegistry,
    ) -> Registration<SenderId> {
        let reg = registry.register_sender(name);
        self.senders.insert(remote.0, reg.id.0);
        reg
    }

    pub fn translate_type(&self, remote: MessageTypeId) -> Option<MessageTypeId> {
        if !remote.is_user() {
            return Some(remote);
        }
        self.types.get(&remote.0).map(|&id| MessageTypeId(id))
    }

    pub fn translate_sender(&self, remote: SenderId) -> Option<SenderId> {
        if !remote.is_user() {
            return Some(remote);
        }
        self.senders.get(&remote.0).map(|&id| SenderId(id))
    }

    pub fn len(&self) -> usize {
        self.types.len() + self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.senders.is_empty()
    }

    /// Forget everything. Used when the peer's channel is lost.
    pub fn clear(&mut self) {
        self.types.clear();
        self.senders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let mut reg = NameRegistry::new();
        let first = reg.register_sender("Tracker0");
        let again = reg.register_sender("Tracker0");
        assert!(first.is_new);
        assert!(!again.is_new);
        assert_eq!(first.id, again.id);
        assert_eq!(reg.senders().count(), 1);
    }

    #[test]
    fn test_ids_follow_registration_order() {
        let mut reg = NameRegistry::new();
        assert_eq!(reg.register_type("Pose").id, MessageTypeId(0));
        assert_eq!(reg.register_type("Velocity").id, MessageTypeId(1));
        assert_eq!(reg.register_type("Pose").id, MessageTypeId(0));
        assert_eq!(reg.register_type("Button").id, MessageTypeId(2));
        let names: Vec<&str> = reg.types().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["Pose", "Velocity", "Button"]);
    }

    #[test]
    fn test_lookups_both_ways() {
        let mut reg = NameRegistry::new();
        let id = reg.register_type("Pose").id;
        assert_eq!(reg.type_id("Pose"), Some(id));
        assert_eq!(reg.type_name(id), Some("Pose"));
        assert_eq!(reg.type_name(MessageTypeId(9)), None);
        assert_eq!(reg.type_name(MessageTypeId(-3)), None);
        assert_eq!(reg.sender_id("Pose"), None);
    }

    #[test]
    fn test_translation_maps_remote_to_local() {
        let mut reg = NameRegistry::new();
        reg.register_type("Button");
        let local_pose = reg.register_type("Pose").id;

        let mut table = TranslationTable::new();
        let learned = table.learn_type(MessageTypeId(0), "Pose", &mut reg);
        assert!(!learned.is_new);
        assert_eq!(table.translate_type(MessageTypeId(0)), Some(local_pose));

        let new_sender = table.learn_sender(SenderId(5), "Imager0", &mut reg);
        assert!(new_sender.is_new);
        assert_eq!(table.translate_sender(SenderId(5)), Some(new_sender.id));
    }

    #[test]
    fn test_unknown_remote_ids_not_guessed() {
        let table = TranslationTable::new();
        assert_eq!(table.translate_type(MessageTypeId(0)), None);
        assert_eq!(table.translate_sender(SenderId(3)), None);
        assert_eq!(table.translate_type(MessageTypeId(-6)), Some(MessageTypeId(-6)));
        assert_eq!(table.translate_sender(SenderId::CONTROL), Some(SenderId::CONTROL));
    }

    #[test]
    fn test_clear_forgets_peer_state_only() {
        let mut reg = NameRegistry::new();
        let mut table = TranslationTable::new();
        table.learn_sender(SenderId(0), "Tracker0", &mut reg);
        assert_eq!(table.len(), 1);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.translate_sender(SenderId(0)), None);
        assert_eq!(reg.sender_id("Tracker0"), Some(SenderId(0)));
    }
}
