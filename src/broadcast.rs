//! Broadcast registry
//!
//! Directory of interactive clients and their outbound queues. Delivery never
//! waits on a peer. A full queue loses that one notification and the peer
//! stays registered; a closed queue means the session is gone, so its entry
//! is dropped. Either way the rest still get the message.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::{notification, Outbound};

/// Outbound queue of one session
pub type PeerSender = mpsc::Sender<Outbound>;

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Client name already registered: {0}")]
    NameTaken(String),
}

/// Outcome of one fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Peers removed because their session had already closed
    pub removed: Vec<String>,
}

/// Concurrent name → outbound queue directory
#[derive(Default)]
pub struct BroadcastRegistry {
    peers: DashMap<String, PeerSender>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and announce it to everyone else.
    pub fn register(&self, name: &str, sender: PeerSender) -> Result<BroadcastReport, RegistryError> {
        match self.peers.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(RegistryError::NameTaken(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(sender);
            }
        }

        tracing::info!(client = %name, peers = self.peers.len(), "Client registered for notifications");
        Ok(self.broadcast(&format!("{} joined", name), Some(name)))
    }

    /// Remove a client and announce its departure.
    ///
    /// Only removes the entry if it still belongs to `sender`; returns `None`
    /// when there was nothing to remove.
    pub fn unregister(&self, name: &str, sender: &PeerSender) -> Option<BroadcastReport> {
        self.peers.remove_if(name, |_, current| current.same_channel(sender))?;

        tracing::info!(client = %name, peers = self.peers.len(), "Client unregistered");
        Some(self.broadcast(&format!("{} left", name), None))
    }

    /// Deliver a notification to every registered peer except `exclude`.
    pub fn broadcast(&self, message: &str, exclude: Option<&str>) -> BroadcastReport {
        let line = notification(message);

        // Snapshot so no shard lock is held while delivering or removing
        let targets: Vec<(String, PeerSender)> = self
            .peers
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != exclude)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut report = BroadcastReport::default();

        for (name, sender) in targets {
            match sender.try_send(Outbound::Line(line.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    // The session is alive but behind; it owns its entry
                    report.failed += 1;
                    tracing::warn!(client = %name, "Outbound queue full, notification dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    report.failed += 1;
                    if self
                        .peers
                        .remove_if(&name, |_, current| current.same_channel(&sender))
                        .is_some()
                    {
                        tracing::warn!(client = %name, "Dropped closed peer from broadcast registry");
                        report.removed.push(name);
                    }
                }
            }
        }

        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast: {}",
            message
        );
        report
    }

    pub fn notify_upload(&self, client: &str, filename: &str, size: u64) -> BroadcastReport {
        self.broadcast(&format!("{} uploaded {} ({} bytes)", client, filename, size), Some(client))
    }

    pub fn notify_download(&self, client: &str, filename: &str) -> BroadcastReport {
        self.broadcast(&format!("{} downloaded {}", client, filename), Some(client))
    }

    pub fn notify_delete(&self, client: &str, filename: &str) -> BroadcastReport {
        self.broadcast(&format!("{} deleted {}", client, filename), Some(client))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> (PeerSender, mpsc::Receiver<Outbound>) {
        mpsc::channel(8)
    }

    fn recv_line(rx: &mut mpsc::Receiver<Outbound>) -> Option<String> {
        match rx.try_recv().ok()? {
            Outbound::Line(line) => Some(line),
            Outbound::Data(_) => None,
        }
    }

    #[test]
    fn test_join_notifies_others_only() {
        let registry = BroadcastRegistry::new();
        let (alice_tx, mut alice_rx) = peer();
        let (bob_tx, mut bob_rx) = peer();

        registry.register("alice", alice_tx).unwrap();
        let report = registry.register("bob", bob_tx).unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(recv_line(&mut alice_rx).as_deref(), Some("NOTIFY: bob joined"));
        assert!(recv_line(&mut bob_rx).is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = BroadcastRegistry::new();
        let (first, _first_rx) = peer();
        let (second, _second_rx) = peer();

        registry.register("alice", first).unwrap();
        assert!(matches!(
            registry.register("alice", second),
            Err(RegistryError::NameTaken(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = BroadcastRegistry::new();
        let (alice_tx, _alice_rx) = peer();
        let (bob_tx, mut bob_rx) = peer();
        registry.register("alice", alice_tx.clone()).unwrap();
        registry.register("bob", bob_tx).unwrap();

        let report = registry.unregister("alice", &alice_tx).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(recv_line(&mut bob_rx).as_deref(), Some("NOTIFY: alice left"));

        assert!(registry.unregister("alice", &alice_tx).is_none());
        assert!(registry.unregister("nobody", &alice_tx).is_none());
        assert!(!registry.is_registered("alice"));
    }

    #[test]
    fn test_unregister_leaves_newer_entry_alone() {
        let registry = BroadcastRegistry::new();
        let (old_tx, _old_rx) = peer();
        let (new_tx, _new_rx) = peer();
        registry.peers.insert("alice".into(), new_tx);

        assert!(registry.unregister("alice", &old_tx).is_none());
        assert!(registry.is_registered("alice"));
    }

    #[test]
    fn test_failed_peer_removed_others_delivered() {
        let registry = BroadcastRegistry::new();
        let (a_tx, mut a_rx) = peer();
        let (dead_tx, dead_rx) = peer();
        let (c_tx, mut c_rx) = peer();
        registry.register("a", a_tx).unwrap();
        registry.register("dead", dead_tx).unwrap();
        registry.register("c", c_tx).unwrap();
        while a_rx.try_recv().is_ok() {}

        drop(dead_rx);
        let report = registry.broadcast("server maintenance", None);

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, vec!["dead".to_string()]);
        assert!(!registry.is_registered("dead"));
        assert!(registry.is_registered("a"));
        assert!(registry.is_registered("c"));
        assert_eq!(recv_line(&mut a_rx).as_deref(), Some("NOTIFY: server maintenance"));
        assert_eq!(recv_line(&mut c_rx).as_deref(), Some("NOTIFY: server maintenance"));
    }

    #[test]
    fn test_full_queue_drops_message_keeps_peer() {
        let registry = BroadcastRegistry::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        registry.register("slow", slow_tx).unwrap();

        assert_eq!(registry.broadcast("one", None).delivered, 1);
        let report = registry.broadcast("two", None);
        assert_eq!(report.failed, 1);
        assert!(report.removed.is_empty());

        // Still the owner of its name, and reachable once it catches up
        assert!(registry.is_registered("slow"));
        let (imposter, _imposter_rx) = peer();
        assert!(matches!(
            registry.register("slow", imposter),
            Err(RegistryError::NameTaken(_))
        ));

        assert_eq!(recv_line(&mut slow_rx).as_deref(), Some("NOTIFY: one"));
        assert_eq!(registry.broadcast("three", None).delivered, 1);
        assert_eq!(recv_line(&mut slow_rx).as_deref(), Some("NOTIFY: three"));
    }

    #[test]
    fn test_event_wrappers_exclude_actor() {
        let registry = BroadcastRegistry::new();
        let (alice_tx, mut alice_rx) = peer();
        let (bob_tx, mut bob_rx) = peer();
        registry.register("alice", alice_tx).unwrap();
        registry.register("bob", bob_tx).unwrap();
        while alice_rx.try_recv().is_ok() {}

        registry.notify_upload("alice", "report.txt", 100);
        registry.notify_delete("bob", "old.txt");

        assert_eq!(
            recv_line(&mut bob_rx).as_deref(),
            Some("NOTIFY: alice uploaded report.txt (100 bytes)")
        );
        assert!(recv_line(&mut bob_rx).is_none());
        assert_eq!(recv_line(&mut alice_rx).as_deref(), Some("NOTIFY: bob deleted old.txt"));
    }
}
