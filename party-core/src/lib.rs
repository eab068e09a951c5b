//! MultiParty protocol core.
//! Host-driven: no I/O; the host feeds datagrams, frames and clock readings in and acts on the results.

pub mod discovery;
pub mod identity;
pub mod protocol;
pub mod seal;
pub mod session;
pub mod transfer;
pub mod wire;

pub use discovery::{
    should_initiate, validate_namespace, DiscoveredPeer, DiscoveryTable, DiscoveryUpdate,
    Metadata, NamespaceError, NAME_KEY,
};
pub use identity::{Keypair, LocalIdentity, PeerId, PeerIdentity, PublicKey};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use seal::{derive_session_keys, Opener, SealError, Sealer, SessionKeys};
pub use session::{Admission, ConnectionState, SessionError, SessionTable};
pub use transfer::{
    Direction, IncomingResource, ResourceHasher, ResourceKind, Transfer, TransferError, TransferId,
    TransferState,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
