use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use parley_types::frames::ServerFrame;

pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<ServerFrame>;

/// Tracks which users are online and where to push their frames.
///
/// One entry per user: registering again replaces the previous channel (last
/// connection wins). Dropping the old sender closes the old receiver, which
/// ends the superseded connection's writer.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// user_id -> (conn_id, sender)
    channels: Arc<RwLock<HashMap<String, (Uuid, FrameSender)>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-user channel. Returns (conn_id, receiver).
    pub fn register(&self, user_id: &str) -> (Uuid, FrameReceiver) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let replaced = self
            .channels
            .write()
            .expect("registry lock poisoned")
            .insert(user_id.to_string(), (conn_id, tx));

        if let Some((old_conn_id, _)) = replaced {
            debug!(user_id = %user_id, %old_conn_id, %conn_id, "Connection replaced");
        }

        (conn_id, rx)
    }

    /// Remove a user's channel, but only if `conn_id` still owns it.
    /// Returns true when the entry was removed.
    pub fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut channels = self.channels.write().expect("registry lock poisoned");
        match channels.get(user_id) {
            Some((stored_conn_id, _)) if *stored_conn_id == conn_id => {
                channels.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Push a frame to a user. Never blocks; returns whether the frame was
    /// handed to a live connection.
    pub fn send_to_user(&self, user_id: &str, frame: ServerFrame) -> bool {
        let channels = self.channels.read().expect("registry lock poisoned");
        match channels.get(user_id) {
            Some((_, tx)) => tx.send(frame).is_ok(),
            None => {
                trace!(user_id = %user_id, kind = frame.kind(), "Recipient offline, frame dropped");
                false
            }
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.channels
            .read()
            .expect("registry lock poisoned")
            .contains_key(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.channels.read().expect("registry lock poisoned").len()
    }

    /// Drop every registered channel. Used at shutdown; each connection's
    /// writer sees its channel close and ends the socket.
    pub fn clear(&self) {
        self.channels.write().expect("registry lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_reaches_registered_user() {
        let registry = ConnectionRegistry::new();
        let (_conn, mut rx) = registry.register("bob");

        assert!(registry.is_online("bob"));
        assert!(registry.send_to_user("bob", ServerFrame::typing("alice", true)));
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::typing("alice", true));
    }

    #[test]
    fn send_to_offline_user_reports_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_user("nobody", ServerFrame::typing("alice", true)));
    }

    #[test]
    fn last_connection_wins() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = registry.register("bob");
        let (second, mut second_rx) = registry.register("bob");
        assert_eq!(registry.online_count(), 1);

        // Old channel is closed once its sender is dropped
        assert!(matches!(
            first_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        registry.send_to_user("bob", ServerFrame::typing("alice", true));
        assert!(second_rx.try_recv().is_ok());

        // The stale connection closing must not evict the new one
        assert!(!registry.unregister("bob", first));
        assert!(registry.is_online("bob"));

        assert!(registry.unregister("bob", second));
        assert!(!registry.is_online("bob"));
    }

    #[test]
    fn send_to_dropped_receiver_reports_false() {
        let registry = ConnectionRegistry::new();
        let (_conn, rx) = registry.register("bob");
        drop(rx);
        assert!(!registry.send_to_user("bob", ServerFrame::typing("alice", false)));
    }

    #[test]
    fn clear_disconnects_everyone() {
        let registry = ConnectionRegistry::new();
        let (_a, mut a_rx) = registry.register("alice");
        let (_b, _b_rx) = registry.register("bob");

        registry.clear();
        assert_eq!(registry.online_count(), 0);
        assert!(matches!(
            a_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
