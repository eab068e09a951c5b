use std::path::PathBuf;
use std::time::Duration;

use party_core::{NamespaceError, PeerId, SealError, TransferError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a control-surface call can return synchronously.
/// Asynchronous failures carry the inner error types in events instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("advertise error: {0}")]
    Advertise(#[from] AdvertiseError),

    #[error("browse error: {0}")]
    Browse(#[from] BrowseError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("peer {0:?} is not connected")]
    NotConnected(PeerId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseError {
    #[error("invalid namespace: {0}")]
    InvalidNamespace(#[from] NamespaceError),
    #[error("already advertising in namespace {0:?}")]
    NamespaceInUse(String),
    #[error("cannot advertise in {requested:?} while advertising in {current:?}")]
    AlreadyAdvertising { current: String, requested: String },
    #[error("discovery transport unavailable: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowseError {
    #[error("invalid namespace: {0}")]
    InvalidNamespace(#[from] NamespaceError),
    #[error("already browsing namespace {0:?}")]
    AlreadyBrowsing(String),
    #[error("discovery transport unavailable: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer rejected the connection")]
    Rejected,
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("peer {0:?} has not been discovered")]
    UnknownPeer(PeerId),
    #[error("cannot connect to self")]
    SelfConnect,
    #[error("expected peer {expected:?}, handshake presented {actual:?}")]
    IdentityMismatch { expected: PeerId, actual: PeerId },
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u8),
    #[error("handshake protocol violation: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("frame error: {0}")]
    Frame(String),
    #[error("seal error: {0}")]
    Seal(#[from] SealError),
    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),
    #[error("peer closed the session")]
    ClosedByPeer,
    #[error("session closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no data directory available for this platform")]
    NoDataDir,
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity record at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("identity record version {0} is not supported")]
    UnsupportedVersion(u8),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
