//! Resource transfers: chunking, progress, whole-resource integrity, terminal-state bookkeeping.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::PeerIdentity;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Transfer identifier (UUID v4 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId([u8; 16]);

impl TransferId {
    pub fn new_random() -> Self {
        TransferId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TransferId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self)
    }
}

/// What the receiver must materialize the bytes into before reporting completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Kept as raw bytes.
    Binary,
    /// Must decode as an image.
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer cancelled by peer: {0}")]
    CancelledByPeer(String),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("resource of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("chunk at offset {got}, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("received more than the announced {total} bytes")]
    Overrun { total: u64 },
    #[error("ended after {actual} of {expected} bytes")]
    Truncated { expected: u64, actual: u64 },
    #[error("resource digest mismatch")]
    DigestMismatch,
    #[error("could not decode resource: {0}")]
    Decode(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("transfer already finished")]
    Finished,
}

impl TransferError {
    /// Terminal state this error puts a transfer in.
    pub fn terminal_state(&self) -> TransferState {
        match self {
            TransferError::Cancelled | TransferError::CancelledByPeer(_) => TransferState::Cancelled,
            _ => TransferState::Failed,
        }
    }
}

/// Split `total_len` bytes into consecutive ranges of at most `chunk_size`.
pub fn split_into_chunks(total_len: u64, chunk_size: usize) -> Vec<Range<u64>> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE as u64
    } else {
        chunk_size as u64
    };
    let mut out = Vec::new();
    let mut start = 0u64;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(start..end);
        start = end;
    }
    out
}

/// SHA-256 of a whole resource.
pub fn hash_resource(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Incremental [`hash_resource`] for resources read or received piecewise.
#[derive(Clone, Default)]
pub struct ResourceHasher(Sha256);

impl ResourceHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl fmt::Debug for ResourceHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResourceHasher")
    }
}

/// Whether moving from `before` to `after` of `total` bytes crosses a whole percent.
/// Reporting only then bounds progress events to about a hundred per transfer.
pub fn crosses_percent(before: u64, after: u64, total: u64) -> bool {
    if after >= total {
        return after != before;
    }
    let pct = |n: u64| (n as u128 * 100) / total as u128;
    pct(after) > pct(before)
}

/// Keep only the final path component and drop characters that are unsafe in file names.
pub fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim_matches('.').trim();
    if trimmed.is_empty() {
        "resource".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Progress and lifecycle of one transfer, either direction.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub peer: PeerIdentity,
    pub name: String,
    pub kind: ResourceKind,
    pub direction: Direction,
    pub total_bytes: u64,
    transferred: u64,
    state: TransferState,
}

impl Transfer {
    pub fn new(
        id: TransferId,
        peer: PeerIdentity,
        name: impl Into<String>,
        kind: ResourceKind,
        direction: Direction,
        total_bytes: u64,
    ) -> Self {
        Self {
            id,
            peer,
            name: name.into(),
            kind,
            direction,
            total_bytes,
            transferred: 0,
            state: TransferState::InProgress,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state != TransferState::InProgress
    }

    /// Record `n` more bytes moved. Returns the new total.
    pub fn advance(&mut self, n: u64) -> Result<u64, TransferError> {
        if self.is_terminal() {
            return Err(TransferError::Finished);
        }
        let next = self.transferred.saturating_add(n);
        if next > self.total_bytes {
            return Err(TransferError::Overrun {
                total: self.total_bytes,
            });
        }
        self.transferred = next;
        Ok(next)
    }

    /// Enter a terminal state. Returns false if the transfer had already finished,
    /// so callers emit exactly one terminal event.
    pub fn finish(&mut self, state: TransferState) -> bool {
        if self.is_terminal() || state == TransferState::InProgress {
            return false;
        }
        self.state = state;
        true
    }
}

/// Receiver-side transfer: accumulates chunks in order and verifies the digest at the end.
#[derive(Debug)]
pub struct IncomingResource {
    pub transfer: Transfer,
    digest: [u8; 32],
    hasher: ResourceHasher,
    buffer: Vec<u8>,
}

const INITIAL_BUFFER: u64 = 1024 * 1024;

impl IncomingResource {
    pub fn new(transfer: Transfer, digest: [u8; 32], max_bytes: u64) -> Result<Self, TransferError> {
        if transfer.total_bytes > max_bytes {
            return Err(TransferError::TooLarge {
                size: transfer.total_bytes,
                max: max_bytes,
            });
        }
        // The announced size is only a claim; grow with what actually arrives.
        let capacity = transfer.total_bytes.min(INITIAL_BUFFER) as usize;
        Ok(Self {
            transfer,
            digest,
            hasher: ResourceHasher::new(),
            buffer: Vec::with_capacity(capacity),
        })
    }

    /// Append a chunk; it must start exactly where the previous one ended.
    pub fn push_chunk(&mut self, offset: u64, bytes: &[u8]) -> Result<u64, TransferError> {
        let expected = self.transfer.transferred();
        if offset != expected {
            return Err(TransferError::OutOfOrder {
                expected,
                got: offset,
            });
        }
        let total = self.transfer.advance(bytes.len() as u64)?;
        self.hasher.update(bytes);
        self.buffer.extend_from_slice(bytes);
        Ok(total)
    }

    /// All bytes announced have arrived and match the offered digest.
    pub fn finish(&mut self) -> Result<Vec<u8>, TransferError> {
        if self.transfer.is_terminal() {
            return Err(TransferError::Finished);
        }
        if self.transfer.transferred() != self.transfer.total_bytes {
            return Err(TransferError::Truncated {
                expected: self.transfer.total_bytes,
                actual: self.transfer.transferred(),
            });
        }
        if std::mem::take(&mut self.hasher).finalize() != self.digest {
            return Err(TransferError::DigestMismatch);
        }
        Ok(std::mem::take(&mut self.buffer))
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn peer() -> PeerIdentity {
        PeerIdentity::new(Keypair::generate().peer_id(), "bob")
    }

    fn incoming(data: &[u8]) -> IncomingResource {
        let t = Transfer::new(
            TransferId::new_random(),
            peer(),
            "photo.png",
            ResourceKind::Binary,
            Direction::Incoming,
            data.len() as u64,
        );
        IncomingResource::new(t, hash_resource(data), 1 << 20).unwrap()
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], 0..30);
        assert_eq!(chunks[3], 90..100);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(90, 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end, 90);
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(0, 30).is_empty());
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks = split_into_chunks(DEFAULT_CHUNK_SIZE as u64 * 2, 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn incoming_reassembles_in_order() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut r = incoming(&data);
        for range in split_into_chunks(100, 30) {
            let chunk = &data[range.start as usize..range.end as usize];
            r.push_chunk(range.start, chunk).unwrap();
        }
        assert_eq!(r.transfer.transferred(), 100);
        assert_eq!(r.finish().unwrap(), data);
    }

    #[test]
    fn gap_is_out_of_order() {
        let data = vec![7u8; 60];
        let mut r = incoming(&data);
        r.push_chunk(0, &data[..30]).unwrap();
        assert_eq!(
            r.push_chunk(40, &data[40..]),
            Err(TransferError::OutOfOrder {
                expected: 30,
                got: 40
            })
        );
    }

    #[test]
    fn overrun_and_truncation_detected() {
        let data = vec![1u8; 10];
        let mut r = incoming(&data);
        assert_eq!(
            r.push_chunk(0, &[0u8; 11]),
            Err(TransferError::Overrun { total: 10 })
        );
        r.push_chunk(0, &data[..5]).unwrap();
        assert_eq!(
            r.finish(),
            Err(TransferError::Truncated {
                expected: 10,
                actual: 5
            })
        );
    }

    #[test]
    fn digest_mismatch_rejected() {
        let data = vec![1u8; 10];
        let mut r = incoming(&data);
        r.push_chunk(0, &[2u8; 10]).unwrap();
        assert_eq!(r.finish(), Err(TransferError::DigestMismatch));
    }

    #[test]
    fn too_large_offer_refused() {
        let t = Transfer::new(
            TransferId::new_random(),
            peer(),
            "big",
            ResourceKind::Binary,
            Direction::Incoming,
            2048,
        );
        assert_eq!(
            IncomingResource::new(t, [0; 32], 1024).unwrap_err(),
            TransferError::TooLarge {
                size: 2048,
                max: 1024
            }
        );
    }

    #[test]
    fn terminal_state_entered_once() {
        let mut t = Transfer::new(
            TransferId::new_random(),
            peer(),
            "x",
            ResourceKind::Binary,
            Direction::Outgoing,
            10,
        );
        assert!(t.finish(TransferState::Cancelled));
        assert!(!t.finish(TransferState::Completed));
        assert_eq!(t.state(), TransferState::Cancelled);
        assert_eq!(t.advance(1), Err(TransferError::Finished));
    }

    #[test]
    fn cancellation_errors_map_to_cancelled_state() {
        assert_eq!(
            TransferError::Cancelled.terminal_state(),
            TransferState::Cancelled
        );
        assert_eq!(
            TransferError::DigestMismatch.terminal_state(),
            TransferState::Failed
        );
    }

    #[test]
    fn incremental_hash_matches_whole() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 7) as u8).collect();
        let mut h = ResourceHasher::new();
        for part in data.chunks(333) {
            h.update(part);
        }
        assert_eq!(h.finalize(), hash_resource(&data));
    }

    #[test]
    fn progress_reported_per_percent() {
        let total = 1_000_000u64;
        let mut reported = 0;
        let mut done = 0;
        while done < total {
            let next = (done + 100).min(total);
            if crosses_percent(done, next, total) {
                reported += 1;
            }
            done = next;
        }
        assert_eq!(reported, 100);
        assert!(crosses_percent(0, 10, 10));
        assert!(!crosses_percent(10, 10, 10));
        assert!(!crosses_percent(0, 5, 1000));
    }

    #[test]
    fn announced_size_does_not_preallocate() {
        let t = Transfer::new(
            TransferId::new_random(),
            peer(),
            "huge",
            ResourceKind::Binary,
            Direction::Incoming,
            u64::MAX / 2,
        );
        let r = IncomingResource::new(t, [0; 32], u64::MAX).unwrap();
        assert!(r.buffer.capacity() <= INITIAL_BUFFER as usize);
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("C:\\Users\\a\\cat.png"), "cat.png");
        assert_eq!(sanitize_name(".."), "resource");
        assert_eq!(sanitize_name("a:b\n.txt"), "a_b_.txt");
    }
}
