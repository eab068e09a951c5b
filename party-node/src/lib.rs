//! MultiParty runtime: LAN discovery, encrypted sessions, typed messages, resource transfer.
//!
//! A [`Node`] joins a discovery namespace, connects to the peers it finds (the lower peer ID
//! dials), and reports everything that happens as [`Event`]s on a broadcast bus.

pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity_store;
pub mod medium;
pub mod node;
pub mod resource;
pub mod session;
pub mod stream;
pub mod transport;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use config::{Config, UndecodablePolicy};
pub use error::{
    AdvertiseError, BrowseError, ConfigError, ConnectionError, Error, Result, StorageError,
    TransportError,
};
pub use events::{Event, ImageInfo, ReceivedResource, TransferResult};
pub use identity_store::IdentityStore;
pub use medium::{LocalHub, Medium};
pub use node::Node;
pub use session::{AcceptPolicy, SessionStats};
pub use stream::{IncomingStream, OutgoingStream};

pub use party_core::{
    DiscoveredPeer, PeerId, PeerIdentity, ResourceKind, TransferError, TransferId,
};

/// Application message type carried by a node.
pub trait Payload: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {}
