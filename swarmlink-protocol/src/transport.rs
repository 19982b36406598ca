//! In-process message transport shared by protocol instances.
//!
//! The bus maps node ids to unbounded queues. Delivery into a single queue
//! preserves enqueue order, which gives the per-sender/per-target ordering
//! guarantee the substrate promises. Protocols attach on `start` and detach
//! on `stop`.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProtocolError;
use crate::message::ProtocolMessage;

/// Shared in-process transport endpoint table.
#[derive(Default)]
pub struct MessageBus {
    endpoints: DashMap<String, mpsc::UnboundedSender<ProtocolMessage>>,
}

impl MessageBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint, returning its inbound queue.
    ///
    /// Re-attaching under the same id replaces the previous queue, so a
    /// stopped-and-restarted protocol gets a fresh backlog.
    pub fn attach(&self, node_id: &str) -> mpsc::UnboundedReceiver<ProtocolMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(node_id.to_string(), tx);
        debug!(event = "bus_attach", node = node_id, "endpoint attached");
        rx
    }

    pub fn detach(&self, node_id: &str) {
        self.endpoints.remove(node_id);
        debug!(event = "bus_detach", node = node_id, "endpoint detached");
    }

    pub fn is_attached(&self, node_id: &str) -> bool {
        self.endpoints.contains_key(node_id)
    }

    /// Deliver a message to one endpoint.
    pub fn deliver(&self, target: &str, message: ProtocolMessage) -> Result<(), ProtocolError> {
        let sender = self
            .endpoints
            .get(target)
            .ok_or_else(|| ProtocolError::no_route(target))?;
        sender
            .send(message)
            .map_err(|_| ProtocolError::no_route(target))
    }

    /// Deliver a copy to every attached endpoint except the message's
    /// sender and anything on its seen-list. Returns the delivery count.
    pub fn fanout(&self, message: &ProtocolMessage) -> usize {
        let seen = message.seen();
        let mut delivered = 0;
        for entry in self.endpoints.iter() {
            let peer = entry.key();
            if peer == &message.sender || seen.iter().any(|id| id == peer) {
                continue;
            }
            if entry.value().send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Ids of every attached endpoint.
    pub fn endpoint_ids(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[tokio::test]
    async fn deliver_reaches_attached_endpoint() {
        let bus = MessageBus::new();
        let mut rx = bus.attach("n1");

        let msg = ProtocolMessage::new(MessageType::Task, "n2").with_target("n1");
        bus.deliver("n1", msg.clone()).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, msg.id);
    }

    #[tokio::test]
    async fn deliver_to_unknown_target_is_no_route() {
        let bus = MessageBus::new();
        let msg = ProtocolMessage::new(MessageType::Task, "n2").with_target("ghost");
        let err = bus.deliver("ghost", msg).unwrap_err();
        assert!(matches!(err, ProtocolError::NoRoute { .. }));
    }

    #[tokio::test]
    async fn fanout_skips_sender_and_seen() {
        let bus = MessageBus::new();
        let mut rx_a = bus.attach("a");
        let mut rx_b = bus.attach("b");
        let _rx_c = bus.attach("c");

        let mut msg = ProtocolMessage::new(MessageType::Broadcast, "a");
        msg.mark_seen("a");
        msg.mark_seen("c");
        assert_eq!(bus.fanout(&msg), 1);

        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn reattach_replaces_queue() {
        let bus = MessageBus::new();
        let _old = bus.attach("n1");
        let mut fresh = bus.attach("n1");

        bus.deliver("n1", ProtocolMessage::new(MessageType::Status, "n2"))
            .unwrap();
        assert!(fresh.recv().await.is_some());
    }
}
