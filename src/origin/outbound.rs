//! Fan-out of rendered payloads to transport senders.

use crate::error::{CacheError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// A transport sender. Delivery is fire-and-forget: the hub logs a
/// failure and moves on.
pub trait OutboundSender: Send + Sync {
    /// Send a delta payload.
    fn send(&self, entity: &str, payload: &str) -> Result<()>;

    /// Send the full content of an entity after a reload.
    fn send_bulk(&self, entity: &str, payload: &str) -> Result<()> {
        self.send(entity, payload)
    }
}

/// Registered senders.
#[derive(Default)]
pub struct OutboundHub {
    senders: RwLock<Vec<Arc<dyn OutboundSender>>>,
}

impl OutboundHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sender: Arc<dyn OutboundSender>) {
        self.senders.write().push(sender);
    }

    pub fn sender_count(&self) -> usize {
        self.senders.read().len()
    }

    /// Hand a delta payload to every sender.
    pub fn publish(&self, entity: &str, payload: &str) {
        self.deliver(entity, payload, false)
    }

    /// Hand a full-content payload to every sender.
    pub fn publish_bulk(&self, entity: &str, payload: &str) {
        self.deliver(entity, payload, true)
    }

    fn deliver(&self, entity: &str, payload: &str, bulk: bool) {
        let senders = self.senders.read();
        debug!(
            "Publishing {} payload for {} to {} senders",
            if bulk { "bulk" } else { "delta" },
            entity,
            senders.len()
        );
        for sender in senders.iter() {
            let result = if bulk {
                sender.send_bulk(entity, payload)
            } else {
                sender.send(entity, payload)
            };
            if let Err(e) = result {
                warn!("Outbound send for {} failed: {}", entity, e);
            }
        }
    }
}

/// A payload queued by [`ChannelSender`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub entity: String,
    pub payload: String,
    pub bulk: bool,
}

/// Queues payloads on a bounded channel for a transport thread to drain.
pub struct ChannelSender {
    sender: Sender<OutboundMessage>,
}

impl ChannelSender {
    /// Create a sender and the receiving end of its queue.
    pub fn bounded(capacity: usize) -> (Self, Receiver<OutboundMessage>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }

    fn try_send(&self, message: OutboundMessage) -> Result<()> {
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                warn!("Outbound queue full, dropping payload for {}", message.entity);
                Ok(())
            }
            Err(TrySendError::Disconnected(message)) => Err(CacheError::Unavailable(format!(
                "outbound queue closed, payload for {} lost",
                message.entity
            ))),
        }
    }
}

impl OutboundSender for ChannelSender {
    fn send(&self, entity: &str, payload: &str) -> Result<()> {
        self.try_send(OutboundMessage {
            entity: entity.to_string(),
            payload: payload.to_string(),
            bulk: false,
        })
    }

    fn send_bulk(&self, entity: &str, payload: &str) -> Result<()> {
        self.try_send(OutboundMessage {
            entity: entity.to_string(),
            payload: payload.to_string(),
            bulk: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl OutboundSender for Failing {
        fn send(&self, _entity: &str, _payload: &str) -> Result<()> {
            Err(CacheError::Unavailable("broker down".into()))
        }
    }

    #[test]
    fn test_publish_reaches_every_sender() {
        let hub = OutboundHub::new();
        let (first, first_rx) = ChannelSender::bounded(4);
        let (second, second_rx) = ChannelSender::bounded(4);
        hub.register(Arc::new(first));
        hub.register(Arc::new(Failing));
        hub.register(Arc::new(second));

        hub.publish("customer", "id,name\n1,Alice");
        hub.publish_bulk("customer", "id,name");

        let message = first_rx.try_recv().unwrap();
        assert_eq!(message.payload, "id,name\n1,Alice");
        assert!(!message.bulk);
        assert!(first_rx.try_recv().unwrap().bulk);
        assert_eq!(second_rx.len(), 2);
    }

    #[test]
    fn test_full_queue_drops() {
        let (sender, receiver) = ChannelSender::bounded(1);
        sender.send("customer", "a").unwrap();
        sender.send("customer", "b").unwrap();
        assert_eq!(receiver.len(), 1);
        assert_eq!(receiver.recv().unwrap().payload, "a");
    }

    #[test]
    fn test_disconnected_queue_errors() {
        let (sender, receiver) = ChannelSender::bounded(1);
        drop(receiver);
        assert!(matches!(
            sender.send("customer", "a"),
            Err(CacheError::Unavailable(_))
        ));
    }
}
