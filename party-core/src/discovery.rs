//! Discovery bookkeeping: namespace rules, the table of announced peers, connection tie-break.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::identity::{PeerId, PeerIdentity, PublicKey};
use crate::protocol::{Message, PROTOCOL_VERSION};

/// Advertised key/value metadata. Ordered so announcements encode deterministically.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key carrying the name passed to `connect_as`.
pub const NAME_KEY: &str = "name";

const MAX_NAMESPACE_LEN: usize = 15;

/// Namespaces follow service-type rules: 1-15 chars of `[a-z0-9-]`, hyphens only between alphanumerics.
pub fn validate_namespace(namespace: &str) -> Result<(), NamespaceError> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        return Err(NamespaceError::Length(namespace.len()));
    }
    if let Some(c) = namespace
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(NamespaceError::InvalidChar(c));
    }
    if namespace.starts_with('-') || namespace.ends_with('-') || namespace.contains("--") {
        return Err(NamespaceError::Hyphen);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
    #[error("namespace must be 1-15 characters, got {0}")]
    Length(usize),
    #[error("namespace contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("namespace hyphens must sit between letters or digits")]
    Hyphen,
}

/// Connection tie-break: of two peers that found each other, only the lower ID invites.
pub fn should_initiate(local: PeerId, remote: PeerId) -> bool {
    local < remote
}

/// A peer seen in the namespace but not necessarily connected.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub identity: PeerIdentity,
    pub public_key: PublicKey,
    pub addr: SocketAddr,
    pub metadata: Metadata,
    pub last_seen: Instant,
}

impl DiscoveredPeer {
    /// Name advertised by the peer's `connect_as`, if any.
    pub fn name(&self) -> Option<&str> {
        self.metadata.get(NAME_KEY).map(String::as_str)
    }
}

/// What a browser learns from one discovery message.
#[derive(Debug, Clone)]
pub enum DiscoveryUpdate {
    Found(DiscoveredPeer),
    Lost(DiscoveredPeer),
}

/// Live set of announced peers in one namespace, keyed by peer ID.
pub struct DiscoveryTable {
    local: PeerId,
    namespace: String,
    peer_timeout: Duration,
    peers: HashMap<PeerId, DiscoveredPeer>,
}

impl DiscoveryTable {
    pub fn new(local: PeerId, namespace: impl Into<String>, peer_timeout: Duration) -> Self {
        Self {
            local,
            namespace: namespace.into(),
            peer_timeout,
            peers: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Apply a discovery message received from `from`. Returns `Found` only for the first
    /// announcement of a peer, `Lost` for a goodbye from a known peer.
    pub fn handle(&mut self, msg: Message, from: IpAddr, now: Instant) -> Option<DiscoveryUpdate> {
        match msg {
            Message::Announce {
                protocol_version,
                namespace,
                peer_id,
                display_name,
                public_key,
                listen_port,
                metadata,
            } => {
                if !self.accepts(protocol_version, &namespace, peer_id) {
                    return None;
                }
                if PeerId::from_public_key(&public_key) != peer_id {
                    return None;
                }
                let addr = SocketAddr::new(from, listen_port);
                if let Some(known) = self.peers.get_mut(&peer_id) {
                    known.addr = addr;
                    known.metadata = metadata;
                    known.last_seen = now;
                    return None;
                }
                let peer = DiscoveredPeer {
                    identity: PeerIdentity::new(peer_id, display_name),
                    public_key,
                    addr,
                    metadata,
                    last_seen: now,
                };
                self.peers.insert(peer_id, peer.clone());
                Some(DiscoveryUpdate::Found(peer))
            }
            Message::Goodbye {
                protocol_version,
                namespace,
                peer_id,
            } => {
                if !self.accepts(protocol_version, &namespace, peer_id) {
                    return None;
                }
                self.peers.remove(&peer_id).map(DiscoveryUpdate::Lost)
            }
            _ => None,
        }
    }

    fn accepts(&self, protocol_version: u8, namespace: &str, peer_id: PeerId) -> bool {
        protocol_version == PROTOCOL_VERSION && namespace == self.namespace && peer_id != self.local
    }

    /// Remove peers silent for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscoveredPeer> {
        let timed_out: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= self.peer_timeout)
            .map(|(id, _)| *id)
            .collect();
        timed_out
            .iter()
            .filter_map(|id| self.peers.remove(id))
            .collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&DiscoveredPeer> {
        self.peers.get(peer)
    }

    pub fn snapshot(&self) -> Vec<DiscoveredPeer> {
        let mut out: Vec<DiscoveredPeer> = self.peers.values().cloned().collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
