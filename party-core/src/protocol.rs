//! MultiParty wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::discovery::Metadata;
use crate::identity::{PeerId, PublicKey};
use crate::transfer::{ResourceKind, TransferId};

/// Current protocol version. Used in announcements and the session hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
///
/// Discovery messages travel as single datagrams. `Hello`/`HelloAck` are plaintext
/// frames on a fresh TCP connection; everything after them is sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence in a namespace.
    Announce {
        protocol_version: u8,
        namespace: String,
        peer_id: PeerId,
        display_name: String,
        public_key: PublicKey,
        listen_port: u16,
        metadata: Metadata,
    },
    /// Discovery: ask advertisers in a namespace to announce now.
    Probe {
        protocol_version: u8,
        namespace: String,
        peer_id: PeerId,
    },
    /// Discovery: advertiser is going away.
    Goodbye {
        protocol_version: u8,
        namespace: String,
        peer_id: PeerId,
    },
    /// Session handshake: sent by both ends, initiator first.
    Hello {
        protocol_version: u8,
        peer_id: PeerId,
        public_key: PublicKey,
        display_name: String,
    },
    /// Session handshake: responder's verdict, follows its Hello.
    HelloAck { accepted: bool },
    /// Application message; `seq` increases per link.
    Data { seq: u64, body: Vec<u8> },
    ResourceOffer {
        transfer_id: TransferId,
        name: String,
        kind: ResourceKind,
        total_bytes: u64,
        digest: [u8; 32],
    },
    ResourceChunk {
        transfer_id: TransferId,
        offset: u64,
        bytes: Vec<u8>,
    },
    ResourceEnd { transfer_id: TransferId },
    /// Either side abandons a transfer.
    ResourceCancel {
        transfer_id: TransferId,
        reason: String,
    },
    StreamOpen { stream_id: u32, name: String },
    StreamData { stream_id: u32, bytes: Vec<u8> },
    StreamClose { stream_id: u32 },
    /// Liveness heartbeat.
    Heartbeat,
    /// Graceful session teardown.
    Bye,
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Announce { .. } => "announce",
            Message::Probe { .. } => "probe",
            Message::Goodbye { .. } => "goodbye",
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello-ack",
            Message::Data { .. } => "data",
            Message::ResourceOffer { .. } => "resource-offer",
            Message::ResourceChunk { .. } => "resource-chunk",
            Message::ResourceEnd { .. } => "resource-end",
            Message::ResourceCancel { .. } => "resource-cancel",
            Message::StreamOpen { .. } => "stream-open",
            Message::StreamData { .. } => "stream-data",
            Message::StreamClose { .. } => "stream-close",
            Message::Heartbeat => "heartbeat",
            Message::Bye => "bye",
        }
    }
}
