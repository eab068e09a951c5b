//! Message channel: typed application messages over the session layer.

use std::marker::PhantomData;

use party_core::wire::{decode_body, encode_body};
use party_core::{PeerId, PeerIdentity};
use tracing::debug;

use crate::config::{MessageConfig, UndecodablePolicy};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::session::SessionManager;
use crate::Payload;

pub struct MessageChannel<M> {
    session: SessionManager,
    config: MessageConfig,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for MessageChannel<M> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            config: self.config.clone(),
            _message: PhantomData,
        }
    }
}

impl<M: Payload> MessageChannel<M> {
    pub fn new(session: SessionManager, config: MessageConfig) -> Self {
        Self {
            session,
            config,
            _message: PhantomData,
        }
    }

    fn encode(&self, message: &M) -> Result<Vec<u8>> {
        let body = encode_body(message).map_err(|e| Error::Serialization(e.to_string()))?;
        if body.len() > self.config.max_message_bytes {
            return Err(Error::Serialization(format!(
                "message of {} bytes exceeds limit of {}",
                body.len(),
                self.config.max_message_bytes
            )));
        }
        Ok(body)
    }

    /// Queue `message` for `peer`. Returns the sequence number it travels under.
    pub fn send(&self, peer: &PeerId, message: &M) -> Result<u64> {
        if !self.session.is_connected(peer) {
            return Err(Error::NotConnected(*peer));
        }
        let body = self.encode(message)?;
        self.session.queue_data(peer, body)
    }

    /// Send to every peer connected right now.
    pub fn send_to_all(&self, message: &M) -> Vec<(PeerIdentity, Result<u64>)> {
        let peers = self.session.connected_peers();
        if peers.is_empty() {
            return Vec::new();
        }
        let body = match self.encode(message) {
            Ok(b) => b,
            Err(e) => {
                let reason = e.to_string();
                return peers
                    .into_iter()
                    .map(|p| (p, Err(Error::Serialization(reason.clone()))))
                    .collect();
            }
        };
        peers
            .into_iter()
            .map(|p| {
                let r = self.session.queue_data(&p.id, body.clone());
                (p, r)
            })
            .collect()
    }

    /// Turn an inbound body into an event, or nothing if it does not decode and the policy drops it.
    pub fn deliver(&self, peer: PeerIdentity, seq: u64, body: &[u8]) -> Option<Event<M>> {
        match decode_body::<M>(body) {
            Ok(message) => Some(Event::MessageReceived { peer, seq, message }),
            Err(e) => match self.config.on_undecodable {
                UndecodablePolicy::Drop => {
                    debug!("dropping undecodable message {} from {}: {}", seq, peer, e);
                    None
                }
                UndecodablePolicy::Report => Some(Event::MessageUndecodable {
                    peer,
                    seq,
                    error: e.to_string(),
                }),
            },
        }
    }
}
