//! Handler registry and synchronous dispatch.
//!
//! Handlers are matched on `(type, sender)` patterns and run in registration
//! order on the thread that pumps the connection. Registration returns a
//! [`HandlerGuard`]; dropping the guard removes the handler, so an owner that
//! goes away can never be called back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telelink_types::{HandlerError, Message, MessageTypeId, SenderId};

/// Callback invoked for each matching message.
pub type HandlerFn = Box<dyn FnMut(&Message) -> Result<(), HandlerError> + Send>;

struct HandlerEntry {
    type_pattern: MessageTypeId,
    sender_pattern: SenderId,
    live: Arc<AtomicBool>,
    callback: HandlerFn,
}

impl HandlerEntry {
    fn matches(&self, message: &Message) -> bool {
        let type_ok = if self.type_pattern == MessageTypeId::ANY {
            message.type_id.is_user()
        } else {
            self.type_pattern == message.type_id
        };
        let sender_ok =
            self.sender_pattern == SenderId::ANY || self.sender_pattern == message.sender;
        type_ok && sender_ok
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

/// Keeps a handler registered for as long as it is alive.
#[must_use = "dropping the guard removes the handler immediately"]
#[derive(Debug)]
pub struct HandlerGuard {
    live: Arc<AtomicBool>,
    detached: bool,
}

impl HandlerGuard {
    /// Keep the handler for the lifetime of the connection.
    pub fn detach(mut self) {
        self.detached = true;
    }

    pub fn is_registered(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if !self.detached {
            self.live.store(false, Ordering::Release);
        }
    }
}

/// Ordered collection of handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A wildcard type matches user messages only;
    /// system messages need their exact type.
    pub fn register(
        &mut self,
        type_pattern: MessageTypeId,
        sender_pattern: SenderId,
        callback: HandlerFn,
    ) -> HandlerGuard {
        let live = Arc::new(AtomicBool::new(true));
        self.entries.push(HandlerEntry {
            type_pattern,
            sender_pattern,
            live: Arc::clone(&live),
            callback,
        });
        HandlerGuard {
            live,
            detached: false,
        }
    }

    /// Run every matching handler in registration order.
    ///
    /// Stops at the first handler error and returns it. Returns the number of
    /// handlers invoked otherwise.
    pub fn dispatch(&mut self, message: &Message) -> Result<usize, HandlerError> {
        self.entries.retain(HandlerEntry::is_live);
        let mut invoked = 0;
        for entry in self.entries.iter_mut() {
            // A handler may have dropped another handler's guard.
            if !entry.is_live() || !entry.matches(message) {
                continue;
            }
            (entry.callback)(message)?;
            invoked += 1;
        }
        Ok(invoked)
    }

    /// Number of handlers whose guard is still alive.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use telelink_types::SystemType;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> HandlerFn {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Box::new(move |msg: &Message| {
            log.lock().unwrap().push(format!("{tag}:{}", msg.type_id));
            Ok(())
        })
    }

    fn msg(type_id: i32, sender: i32) -> Message {
        Message::new(MessageTypeId(type_id), SenderId(sender), Vec::new())
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        let _a = reg.register(MessageTypeId(0), SenderId::ANY, recorder(&log, "a"));
        let _b = reg.register(MessageTypeId::ANY, SenderId(1), recorder(&log, "b"));
        let _c = reg.register(MessageTypeId::ANY, SenderId::ANY, recorder(&log, "c"));

        assert_eq!(reg.dispatch(&msg(0, 1)).unwrap(), 3);
        assert_eq!(reg.dispatch(&msg(0, 2)).unwrap(), 2);
        assert_eq!(reg.dispatch(&msg(4, 1)).unwrap(), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:0", "b:0", "c:0", "a:0", "c:0", "b:4", "c:4"]
        );
    }

    #[test]
    fn test_wildcard_type_skips_system_messages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        let _any = reg.register(MessageTypeId::ANY, SenderId::ANY, recorder(&log, "any"));
        let _drop = reg.register(
            SystemType::DroppedConnection.id(),
            SenderId::ANY,
            recorder(&log, "drop"),
        );

        let event = Message::new(SystemType::DroppedConnection.id(), SenderId::CONTROL, Vec::new());
        assert_eq!(reg.dispatch(&event).unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["drop:-9"]);
    }

    #[test]
    fn test_dropping_guard_deregisters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        let guard = reg.register(MessageTypeId::ANY, SenderId::ANY, recorder(&log, "x"));
        assert_eq!(reg.len(), 1);
        assert!(guard.is_registered());
        drop(guard);
        assert_eq!(reg.len(), 0);
        assert_eq!(reg.dispatch(&msg(0, 0)).unwrap(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_detached_handler_survives_guard() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        reg.register(MessageTypeId::ANY, SenderId::ANY, recorder(&log, "x"))
            .detach();
        assert_eq!(reg.dispatch(&msg(1, 0)).unwrap(), 1);
    }

    #[test]
    fn test_handler_dropped_mid_dispatch_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        let victim_slot: Arc<Mutex<Option<HandlerGuard>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim_slot);
        let _killer = reg.register(
            MessageTypeId::ANY,
            SenderId::ANY,
            Box::new(move |_msg: &Message| {
                slot.lock().unwrap().take();
                Ok(())
            }),
        );
        let victim = reg.register(MessageTypeId::ANY, SenderId::ANY, recorder(&log, "victim"));
        *victim_slot.lock().unwrap() = Some(victim);

        assert_eq!(reg.dispatch(&msg(0, 0)).unwrap(), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_error_stops_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = HandlerRegistry::new();
        let _bad = reg.register(
            MessageTypeId::ANY,
            SenderId::ANY,
            Box::new(|_msg: &Message| Err(HandlerError::new("device state lost"))),
        );
        let _later = reg.register(MessageTypeId::ANY, SenderId::ANY, recorder(&log, "later"));

        let err = reg.dispatch(&msg(0, 0)).unwrap_err();
        assert_eq!(err.to_string(), "device state lost");
        assert!(log.lock().unwrap().is_empty());
    }
}
