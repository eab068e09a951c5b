//! Event surface: everything the node reports asynchronously, fanned out over one broadcast channel.

use std::path::PathBuf;

use party_core::{Direction, PeerIdentity, ResourceKind, TransferError, TransferId};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{AdvertiseError, BrowseError, ConnectionError, TransportError};
use crate::stream::IncomingStream;

#[derive(Debug, Clone)]
pub enum Event<M> {
    /// First announcement of a peer in the browsed namespace.
    PeerFound {
        peer: PeerIdentity,
        /// Name advertised with `connect_as`.
        name: Option<String>,
    },
    PeerLost {
        peer: PeerIdentity,
    },
    PeerConnected {
        peer: PeerIdentity,
    },
    PeerDisconnected {
        peer: PeerIdentity,
    },
    PeerConnectionFailed {
        peer: PeerIdentity,
        error: ConnectionError,
    },
    MessageReceived {
        peer: PeerIdentity,
        seq: u64,
        message: M,
    },
    /// Only emitted when `messages.on_undecodable = "report"`.
    MessageUndecodable {
        peer: PeerIdentity,
        seq: u64,
        error: String,
    },
    /// A queued message never reached the wire.
    DeliveryFailed {
        peer: PeerIdentity,
        seq: u64,
        error: TransportError,
    },
    TransferStarted {
        peer: PeerIdentity,
        transfer_id: TransferId,
        name: String,
        kind: ResourceKind,
        direction: Direction,
        total_bytes: u64,
    },
    TransferProgress {
        peer: PeerIdentity,
        transfer_id: TransferId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    TransferCompleted {
        peer: PeerIdentity,
        transfer_id: TransferId,
        result: TransferResult,
    },
    TransferFailed {
        peer: PeerIdentity,
        transfer_id: TransferId,
        error: TransferError,
    },
    StreamReceived {
        peer: PeerIdentity,
        name: String,
        stream: IncomingStream,
    },
    AdvertiseFailed {
        error: AdvertiseError,
    },
    BrowseFailed {
        error: BrowseError,
    },
}

impl<M> Event<M> {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PeerFound { .. } => "peer-found",
            Event::PeerLost { .. } => "peer-lost",
            Event::PeerConnected { .. } => "peer-connected",
            Event::PeerDisconnected { .. } => "peer-disconnected",
            Event::PeerConnectionFailed { .. } => "peer-connection-failed",
            Event::MessageReceived { .. } => "message-received",
            Event::MessageUndecodable { .. } => "message-undecodable",
            Event::DeliveryFailed { .. } => "delivery-failed",
            Event::TransferStarted { .. } => "transfer-started",
            Event::TransferProgress { .. } => "transfer-progress",
            Event::TransferCompleted { .. } => "transfer-completed",
            Event::TransferFailed { .. } => "transfer-failed",
            Event::StreamReceived { .. } => "stream-received",
            Event::AdvertiseFailed { .. } => "advertise-failed",
            Event::BrowseFailed { .. } => "browse-failed",
        }
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone)]
pub enum TransferResult {
    Sent { name: String, len: u64 },
    Received(ReceivedResource),
}

/// A verified resource, already written to the inbox.
#[derive(Debug, Clone)]
pub struct ReceivedResource {
    pub transfer_id: TransferId,
    pub name: String,
    pub kind: ResourceKind,
    pub path: PathBuf,
    pub len: u64,
    pub digest: [u8; 32],
    /// Set for `ResourceKind::Image`.
    pub image: Option<ImageInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
}

/// Fan-out to any number of subscribers. Emitting with no subscribers is not an error.
pub struct EventBus<M> {
    tx: broadcast::Sender<Event<M>>,
}

impl<M: Clone> EventBus<M> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: Event<M>) {
        trace!(kind = event.kind(), "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event<M>> {
        self.tx.subscribe()
    }
}

impl<M> Clone for EventBus<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use party_core::Keypair;

    #[tokio::test]
    async fn every_subscriber_sees_events_in_order() {
        let bus: EventBus<String> = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let peer = PeerIdentity::new(Keypair::generate().peer_id(), "bob");
        bus.emit(Event::PeerConnected { peer: peer.clone() });
        bus.emit(Event::PeerDisconnected { peer });
        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap().kind(), "peer-connected");
            assert_eq!(rx.recv().await.unwrap().kind(), "peer-disconnected");
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus: EventBus<u32> = EventBus::new(1);
        bus.emit(Event::BrowseFailed {
            error: BrowseError::Transport("down".into()),
        });
    }
}
