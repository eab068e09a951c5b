//! Per-peer connection state machine: NotConnected → Connecting → Connected → NotConnected.
//! `Connecting` may fall straight back to `NotConnected` on timeout, rejection or transport error.

use std::collections::HashMap;

use crate::identity::{PeerId, PeerIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
}

/// Verdict on an incoming hello, before any application policy is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No conflicting state; the application policy decides.
    Admit,
    /// We are also dialing this peer and it sorts lower, so its attempt wins over ours.
    Supersede,
    /// Already connected to this peer.
    AlreadyConnected,
    /// We are dialing this peer and we sort lower; our attempt wins.
    Duplicate,
    /// The hello carries our own ID.
    SelfConnect,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot connect to self")]
    SelfConnect,
    #[error("already connecting to {0:?}")]
    AlreadyConnecting(PeerId),
    #[error("already connected to {0:?}")]
    AlreadyConnected(PeerId),
    #[error("no connection attempt in progress for {0:?}")]
    NotConnecting(PeerId),
}

struct Entry {
    state: ConnectionState,
    identity: PeerIdentity,
}

/// Connection state for every peer the local session knows about.
/// Peers in `NotConnected` are not stored.
pub struct SessionTable {
    local: PeerId,
    entries: HashMap<PeerId, Entry>,
}

impl SessionTable {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            entries: HashMap::new(),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        self.entries
            .get(peer)
            .map(|e| e.state)
            .unwrap_or(ConnectionState::NotConnected)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state(peer) == ConnectionState::Connected
    }

    pub fn identity(&self, peer: &PeerId) -> Option<&PeerIdentity> {
        self.entries.get(peer).map(|e| &e.identity)
    }

    /// NotConnected → Connecting.
    pub fn begin_connect(&mut self, peer: PeerIdentity) -> Result<(), SessionError> {
        if peer.id == self.local {
            return Err(SessionError::SelfConnect);
        }
        match self.state(&peer.id) {
            ConnectionState::Connecting => Err(SessionError::AlreadyConnecting(peer.id)),
            ConnectionState::Connected => Err(SessionError::AlreadyConnected(peer.id)),
            ConnectionState::NotConnected => {
                self.entries.insert(
                    peer.id,
                    Entry {
                        state: ConnectionState::Connecting,
                        identity: peer,
                    },
                );
                Ok(())
            }
        }
    }

    /// Classify an incoming hello against current state.
    pub fn admission(&self, remote: PeerId) -> Admission {
        if remote == self.local {
            return Admission::SelfConnect;
        }
        match self.state(&remote) {
            ConnectionState::Connected => Admission::AlreadyConnected,
            ConnectionState::Connecting if remote < self.local => Admission::Supersede,
            ConnectionState::Connecting => Admission::Duplicate,
            ConnectionState::NotConnected => Admission::Admit,
        }
    }

    /// Connecting → Connected. The identity from the handshake replaces the one we dialed with.
    pub fn mark_connected(&mut self, peer: PeerIdentity) -> Result<(), SessionError> {
        match self.entries.get_mut(&peer.id) {
            Some(entry) if entry.state == ConnectionState::Connecting => {
                entry.state = ConnectionState::Connected;
                entry.identity = peer;
                Ok(())
            }
            Some(_) => Err(SessionError::AlreadyConnected(peer.id)),
            None => Err(SessionError::NotConnecting(peer.id)),
        }
    }

    /// Any state → NotConnected. Returns the state the peer was in.
    pub fn mark_disconnected(&mut self, peer: &PeerId) -> ConnectionState {
        self.entries
            .remove(peer)
            .map(|e| e.state)
            .unwrap_or(ConnectionState::NotConnected)
    }

    /// Point-in-time snapshot of the connected set, ordered by ID.
    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        let mut out: Vec<PeerIdentity> = self
            .entries
            .values()
            .filter(|e| e.state == ConnectionState::Connected)
            .map(|e| e.identity.clone())
            .collect();
        out.sort();
        out
    }

    /// Drop every peer back to NotConnected, returning what each was.
    pub fn clear(&mut self) -> Vec<(PeerIdentity, ConnectionState)> {
        self.entries
            .drain()
            .map(|(_, e)| (e.identity, e.state))
            .collect()
    }
}
