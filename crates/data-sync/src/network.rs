//! Connectivity state tracking
//!
//! The SDK does not probe the network itself; the host application reports
//! connectivity transitions and interested tasks observe them through a
//! watch channel.

use tokio::sync::watch;

/// Shared connectivity flag with change notification.
pub struct NetworkWatcher {
    sender: watch::Sender<bool>,
}

impl NetworkWatcher {
    /// Create a watcher with the given initial state.
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Record a connectivity change.
    ///
    /// Returns true only on an offline-to-online transition, the moment the
    /// pending-operation outbox should be drained.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = *self.sender.borrow();
        self.sender.send_replace(online);
        online && !was_online
    }

    /// Subscribe to connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for NetworkWatcher {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_transition_detected() {
        let watcher = NetworkWatcher::new(true);
        assert!(watcher.is_online());

        // Staying online is not a reconnect.
        assert!(!watcher.set_online(true));
        assert!(!watcher.set_online(false));
        assert!(!watcher.is_online());
        assert!(watcher.set_online(true));
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let watcher = NetworkWatcher::new(false);
        let mut receiver = watcher.subscribe();

        watcher.set_online(true);
        receiver.changed().await.unwrap();
        assert!(*receiver.borrow());
    }
}
