//! Push events delivered to peers without a corresponding request

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::rtp::MediaKind;
use crate::types::{ConsumerId, PeerId, ProducerId, TransportId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Another peer in the room started producing
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    /// The server is about to drop the channel
    Disconnected {
        reason: String,
    },
}

/// Per-peer bounded event queues
pub struct PeerEventHub {
    senders: DashMap<PeerId, mpsc::Sender<PeerEvent>>,
    capacity: usize,
}

impl PeerEventHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open the event queue of a peer, replacing any previous one
    pub fn register(&self, peer_id: PeerId) -> mpsc::Receiver<PeerEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.insert(peer_id, tx);
        rx
    }

    pub fn unregister(&self, peer_id: &PeerId) {
        self.senders.remove(peer_id);
    }

    /// Queue an event for a peer. Returns false if it was dropped.
    pub fn send(&self, peer_id: &PeerId, event: PeerEvent) -> bool {
        let Some(sender) = self.senders.get(peer_id).map(|s| s.value().clone()) else {
            debug!(peer_id = %peer_id, ?event, "No event queue for peer, dropping event");
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(peer_id = %peer_id, ?event, "Peer event queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.senders.remove(peer_id);
                false
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
