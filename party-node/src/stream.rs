//! Named byte streams over an established link.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use party_core::{Message, PeerId, PeerIdentity};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, TransportError};
use crate::session::{LinkSender, SessionManager, Ticket};

#[derive(Default)]
struct Streams {
    next_id: u32,
    incoming: HashMap<(PeerId, u32), mpsc::UnboundedSender<Vec<u8>>>,
}

/// Routes stream frames to their `IncomingStream` and hands out outgoing ids.
#[derive(Default)]
pub struct StreamRegistry {
    inner: Mutex<Streams>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(
        &self,
        session: &SessionManager,
        peer: &PeerId,
        name: &str,
    ) -> Result<OutgoingStream, Error> {
        let link = session.sender(peer)?;
        let id = {
            let mut st = self.lock();
            st.next_id = st.next_id.wrapping_add(1);
            st.next_id
        };
        link.send(
            Message::StreamOpen {
                stream_id: id,
                name: name.to_string(),
            },
            Ticket::None,
        )?;
        debug!("opened stream {} {:?} to {}", id, name, link.peer());
        Ok(OutgoingStream {
            link,
            id,
            name: name.to_string(),
            closed: false,
        })
    }

    pub fn on_open(&self, peer: PeerIdentity, stream_id: u32, name: String) -> IncomingStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().incoming.insert((peer.id, stream_id), tx);
        IncomingStream {
            peer,
            name,
            id: stream_id,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    pub fn on_data(&self, peer: &PeerId, stream_id: u32, bytes: Vec<u8>) {
        match self.lock().incoming.get(&(*peer, stream_id)) {
            Some(tx) => {
                let _ = tx.send(bytes);
            }
            None => debug!("data for unknown stream {} from {:?}", stream_id, peer),
        }
    }

    pub fn on_close(&self, peer: &PeerId, stream_id: u32) {
        self.lock().incoming.remove(&(*peer, stream_id));
    }

    /// End every stream from `peer`; readers see `None` after buffered data.
    pub fn close_peer(&self, peer: &PeerId) {
        self.lock().incoming.retain(|(p, _), _| p != peer);
    }

    pub fn clear(&self) {
        self.lock().incoming.clear();
    }
}

/// Sending end. Dropping it closes the stream.
pub struct OutgoingStream {
    link: LinkSender,
    id: u32,
    name: String,
    closed: bool,
}

impl OutgoingStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &PeerIdentity {
        self.link.peer()
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.link.send(
            Message::StreamData {
                stream_id: self.id,
                bytes: bytes.to_vec(),
            },
            Ticket::None,
        )
    }

    pub fn finish(mut self) -> Result<(), TransportError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.link.send(
            Message::StreamClose { stream_id: self.id },
            Ticket::None,
        )
    }
}

impl Drop for OutgoingStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for OutgoingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingStream")
            .field("peer", self.link.peer())
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Receiving end, handed out in `Event::StreamReceived`. Clones share one reader.
#[derive(Debug, Clone)]
pub struct IncomingStream {
    pub peer: PeerIdentity,
    pub name: String,
    pub id: u32,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl IncomingStream {
    /// Next chunk in order; `None` once the sender closed or the peer went away.
    pub async fn next_chunk(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use party_core::Keypair;

    fn peer() -> PeerIdentity {
        PeerIdentity::new(Keypair::generate().peer_id(), "bob")
    }

    #[tokio::test]
    async fn incoming_yields_in_order_then_ends() {
        let reg = StreamRegistry::new();
        let bob = peer();
        let stream = reg.on_open(bob.clone(), 7, "mic".into());
        reg.on_data(&bob.id, 7, b"ab".to_vec());
        reg.on_data(&bob.id, 7, b"cd".to_vec());
        reg.on_close(&bob.id, 7);
        reg.on_data(&bob.id, 7, b"late".to_vec());
        assert_eq!(stream.read_to_end().await, b"abcd");
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn peer_loss_ends_its_streams_only() {
        let reg = StreamRegistry::new();
        let bob = peer();
        let carol = peer();
        let from_bob = reg.on_open(bob.clone(), 1, "a".into());
        let from_carol = reg.on_open(carol.clone(), 1, "b".into());
        reg.close_peer(&bob.id);
        assert!(from_bob.next_chunk().await.is_none());
        reg.on_data(&carol.id, 1, vec![9]);
        assert_eq!(from_carol.next_chunk().await, Some(vec![9]));
    }
}
