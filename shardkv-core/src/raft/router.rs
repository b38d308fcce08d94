//! In-process delivery of raft messages between the nodes of one participant

use dashmap::DashMap;
use raft::prelude::Message;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

struct Mailbox {
    tx: mpsc::UnboundedSender<Message>,
    connected: bool,
}

/// Routes messages by destination node id. A disconnected node neither sends
/// nor receives.
#[derive(Clone, Default)]
pub struct RaftRouter {
    nodes: Arc<DashMap<u64, Mailbox>>,
}

impl RaftRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id` and return its inbound message stream. Registering
    /// again replaces the previous mailbox.
    pub fn register(&self, node_id: u64) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(node_id, Mailbox { tx, connected: true });
        rx
    }

    /// Deliver `msg` to `msg.to`; false when it was dropped
    pub fn send(&self, msg: Message) -> bool {
        let from_connected = self
            .nodes
            .get(&msg.from)
            .map(|m| m.connected)
            .unwrap_or(false);
        if !from_connected {
            return false;
        }
        match self.nodes.get(&msg.to) {
            Some(mailbox) if mailbox.connected => mailbox.tx.send(msg).is_ok(),
            _ => {
                trace!(to = msg.to, "dropping raft message to unreachable node");
                false
            }
        }
    }

    pub fn disconnect(&self, node_id: u64) {
        if let Some(mut mailbox) = self.nodes.get_mut(&node_id) {
            mailbox.connected = false;
        }
    }

    pub fn connect(&self, node_id: u64) {
        if let Some(mut mailbox) = self.nodes.get_mut(&node_id) {
            mailbox.connected = true;
        }
    }

    pub fn is_connected(&self, node_id: u64) -> bool {
        self.nodes
            .get(&node_id)
            .map(|m| m.connected)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: u64, to: u64) -> Message {
        let mut msg = Message::default();
        msg.from = from;
        msg.to = to;
        msg
    }

    #[test]
    fn test_disconnected_nodes_drop_traffic() {
        let router = RaftRouter::new();
        let _rx1 = router.register(1);
        let mut rx2 = router.register(2);

        assert!(router.send(message(1, 2)));
        assert!(rx2.try_recv().is_ok());

        router.disconnect(2);
        assert!(!router.send(message(1, 2)));
        assert!(!router.send(message(2, 1)));

        router.connect(2);
        assert!(router.send(message(1, 2)));
        assert!(!router.send(message(1, 3)));
    }
}
