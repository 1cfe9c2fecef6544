use std::collections::HashMap;

use parking_lot::RwLock;
use strum::{Display, IntoStaticStr};

/// Events the cluster reconciler publishes on a `RisingWave`.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, IntoStaticStr, PartialEq)]
pub enum ClusterEvent {
    Initializing,
    Running,
    Upgrading,
    Unhealthy,
}

impl ClusterEvent {
    pub fn is_warning(&self) -> bool {
        matches!(self, ClusterEvent::Unhealthy)
    }
}

/// The last message published per object and event, so repeated reconciles of an unchanged
/// object do not flood the event stream.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: RwLock<HashMap<(String, ClusterEvent), String>>,
}

impl MessageStore {
    pub fn set_message(&self, uid: &str, event: ClusterEvent, message: impl Into<String>) {
        self.messages
            .write()
            .insert((uid.to_string(), event), message.into());
    }

    /// The stored message, or the name of the event if none was set.
    pub fn message_for(&self, uid: &str, event: ClusterEvent) -> String {
        self.messages
            .read()
            .get(&(uid.to_string(), event))
            .cloned()
            .unwrap_or_else(|| event.to_string())
    }

    pub fn is_message_set(&self, uid: &str, event: ClusterEvent) -> bool {
        self.messages
            .read()
            .contains_key(&(uid.to_string(), event))
    }

    /// Records `message` and returns true if it differs from the last one stored for the same
    /// object and event.
    pub fn should_emit(&self, uid: &str, event: ClusterEvent, message: &str) -> bool {
        if self.is_message_set(uid, event) && self.message_for(uid, event) == message {
            return false;
        }
        self.set_message(uid, event, message);
        true
    }

    pub fn clear_message(&self, uid: &str, event: ClusterEvent) {
        self.messages.write().remove(&(uid.to_string(), event));
    }

    /// Drops everything stored for an object that is gone.
    pub fn forget(&self, uid: &str) {
        self.messages.write().retain(|(key_uid, _), _| key_uid != uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_store() {
        let store = MessageStore::default();
        assert!(!store.is_message_set("a", ClusterEvent::Unhealthy));
        assert_eq!(store.message_for("a", ClusterEvent::Unhealthy), "Unhealthy");

        store.set_message("a", ClusterEvent::Unhealthy, "services missing");
        assert!(store.is_message_set("a", ClusterEvent::Unhealthy));
        assert!(!store.is_message_set("b", ClusterEvent::Unhealthy));
        assert_eq!(
            store.message_for("a", ClusterEvent::Unhealthy),
            "services missing"
        );
    }

    #[test]
    fn test_should_emit_deduplicates() {
        let store = MessageStore::default();
        assert!(store.should_emit("a", ClusterEvent::Unhealthy, "x missing"));
        assert!(!store.should_emit("a", ClusterEvent::Unhealthy, "x missing"));
        assert!(store.should_emit("a", ClusterEvent::Running, "x missing"));
        assert!(store.should_emit("b", ClusterEvent::Unhealthy, "x missing"));
        assert!(store.should_emit("a", ClusterEvent::Unhealthy, "y missing"));

        store.clear_message("a", ClusterEvent::Unhealthy);
        assert!(!store.is_message_set("a", ClusterEvent::Unhealthy));
        assert!(store.is_message_set("a", ClusterEvent::Running));

        store.forget("a");
        assert!(store.should_emit("a", ClusterEvent::Unhealthy, "y missing"));
    }
}
