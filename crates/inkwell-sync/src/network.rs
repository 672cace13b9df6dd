//! Connectivity state.
//!
//! The platform layer reports reachability changes with
//! [`NetworkStatus::set_online`]; the transport client consults it before
//! every request and the sync worker wakes up on offline -> online edges.

use tokio::sync::watch;

/// Shared, observable "is there a network path" flag.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    tx: watch::Sender<bool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a reachability change. Subscribers are only notified when the
    /// value actually flips.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Receiver that resolves `changed()` on every flip.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_flips_only() {
        let status = NetworkStatus::offline();
        let mut rx = status.subscribe();

        status.set_online(false);
        assert!(!rx.has_changed().unwrap());

        status.set_online(true);
        assert!(rx.has_changed().unwrap());
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(status.is_online());
    }
}
