//! Session transport: length-prefixed frames over a byte stream, the hello handshake, sealed frames.

use std::io;

use party_core::wire::{decode_message, encode_message, frame_bytes, frame_len, LEN_SIZE};
use party_core::{
    derive_session_keys, LocalIdentity, Message, Opener, PeerId, PeerIdentity, PublicKey, Sealer,
    SessionKeys, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ConnectionError, TransportError};

/// Read one length-prefixed frame. A clean EOF before the prefix is `ClosedByPeer`.
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut prefix = [0u8; LEN_SIZE];
    match r.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ClosedByPeer)
        }
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(prefix).map_err(|e| TransportError::Frame(e.to_string()))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    w.write_all(&frame_bytes(payload)).await?;
    w.flush().await?;
    Ok(())
}

fn encode(msg: &Message) -> Result<Vec<u8>, TransportError> {
    encode_message(msg).map_err(|e| TransportError::Frame(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Message, TransportError> {
    decode_message(bytes).map_err(|e| TransportError::Frame(e.to_string()))
}

/// Plaintext frame, used only for the handshake.
pub async fn write_plain<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), TransportError> {
    write_frame(w, &encode(msg)?).await
}

pub async fn read_plain<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, TransportError> {
    decode(&read_frame(r).await?)
}

/// Outbound half of an established session.
pub struct SealedWriter<W> {
    inner: W,
    sealer: Sealer,
}

impl<W: AsyncWrite + Unpin> SealedWriter<W> {
    pub fn new(inner: W, keys: &SessionKeys) -> Result<Self, TransportError> {
        Ok(Self {
            inner,
            sealer: Sealer::new(&keys.send)?,
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let sealed = self.sealer.seal(&encode(msg)?)?;
        write_frame(&mut self.inner, &sealed).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Inbound half of an established session.
pub struct SealedReader<R> {
    inner: R,
    opener: Opener,
}

impl<R: AsyncRead + Unpin> SealedReader<R> {
    pub fn new(inner: R, keys: &SessionKeys) -> Result<Self, TransportError> {
        Ok(Self {
            inner,
            opener: Opener::new(&keys.recv)?,
        })
    }

    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        let sealed = read_frame(&mut self.inner).await?;
        decode(&self.opener.open(&sealed)?)
    }
}

/// A verified hello from the other end.
#[derive(Debug, Clone)]
pub struct RemoteHello {
    pub identity: PeerIdentity,
    pub public_key: PublicKey,
}

impl RemoteHello {
    pub fn session_keys(&self, local: &LocalIdentity) -> SessionKeys {
        let shared = local.keypair().shared_secret(&self.public_key);
        derive_session_keys(&shared, local.peer_id(), self.identity.id)
    }
}

fn hello(local: &LocalIdentity) -> Message {
    Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        peer_id: local.peer_id(),
        public_key: local.keypair().public_key().clone(),
        display_name: local.display_name().to_string(),
    }
}

fn handshake_io(e: TransportError) -> ConnectionError {
    match e {
        TransportError::Io(s) => ConnectionError::Io(s),
        TransportError::ClosedByPeer => ConnectionError::Io("closed during handshake".into()),
        other => ConnectionError::Protocol(other.to_string()),
    }
}

/// Read the peer's hello and check it is self-consistent.
pub async fn read_hello<S: AsyncRead + Unpin>(stream: &mut S) -> Result<RemoteHello, ConnectionError> {
    match read_plain(stream).await.map_err(handshake_io)? {
        Message::Hello {
            protocol_version,
            peer_id,
            public_key,
            display_name,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ConnectionError::VersionMismatch(protocol_version));
            }
            let derived = PeerId::from_public_key(&public_key);
            if derived != peer_id {
                return Err(ConnectionError::IdentityMismatch {
                    expected: derived,
                    actual: peer_id,
                });
            }
            Ok(RemoteHello {
                identity: PeerIdentity::new(peer_id, display_name),
                public_key,
            })
        }
        other => Err(ConnectionError::Protocol(format!(
            "expected hello, got {}",
            other.kind()
        ))),
    }
}

/// Dialing side: hello, then the peer's hello and its verdict.
pub async fn handshake_initiator<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local: &LocalIdentity,
    expected: PeerId,
) -> Result<RemoteHello, ConnectionError> {
    write_plain(stream, &hello(local))
        .await
        .map_err(handshake_io)?;
    let remote = read_hello(stream).await?;
    if remote.identity.id != expected {
        return Err(ConnectionError::IdentityMismatch {
            expected,
            actual: remote.identity.id,
        });
    }
    match read_plain(stream).await.map_err(handshake_io)? {
        Message::HelloAck { accepted: true } => Ok(remote),
        Message::HelloAck { accepted: false } => Err(ConnectionError::Rejected),
        other => Err(ConnectionError::Protocol(format!(
            "expected hello-ack, got {}",
            other.kind()
        ))),
    }
}

/// Answering side, after `read_hello` and the admission decision.
pub async fn answer_hello<S: AsyncWrite + Unpin>(
    stream: &mut S,
    local: &LocalIdentity,
    accepted: bool,
) -> Result<(), ConnectionError> {
    write_plain(stream, &hello(local))
        .await
        .map_err(handshake_io)?;
    write_plain(stream, &Message::HelloAck { accepted })
        .await
        .map_err(handshake_io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_then_sealed_traffic() {
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let bob_id = bob.peer_id();
        let dial = {
            let alice = alice.clone();
            tokio::spawn(async move {
                let remote = handshake_initiator(&mut a, &alice, bob_id).await.unwrap();
                (a, remote)
            })
        };
        let from_alice = read_hello(&mut b).await.unwrap();
        assert_eq!(from_alice.identity.id, alice.peer_id());
        assert_eq!(from_alice.identity.display_name, "alice");
        answer_hello(&mut b, &bob, true).await.unwrap();
        let (a, from_bob) = dial.await.unwrap();
        assert_eq!(from_bob.identity.id, bob.peer_id());

        let (_ar, aw) = tokio::io::split(a);
        let (br, _bw) = tokio::io::split(b);
        let mut writer = SealedWriter::new(aw, &from_bob.session_keys(&alice)).unwrap();
        let mut reader = SealedReader::new(br, &from_alice.session_keys(&bob)).unwrap();
        for seq in 0..3 {
            writer
                .send(&Message::Data {
                    seq,
                    body: vec![seq as u8],
                })
                .await
                .unwrap();
        }
        for seq in 0..3 {
            assert_eq!(
                reader.recv().await.unwrap(),
                Message::Data {
                    seq,
                    body: vec![seq as u8]
                }
            );
        }
    }

    #[tokio::test]
    async fn rejection_reaches_initiator() {
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let bob_id = bob.peer_id();
        let dial = tokio::spawn(async move { handshake_initiator(&mut a, &alice, bob_id).await });
        read_hello(&mut b).await.unwrap();
        answer_hello(&mut b, &bob, false).await.unwrap();
        assert_eq!(dial.await.unwrap().unwrap_err(), ConnectionError::Rejected);
    }

    #[tokio::test]
    async fn wrong_peer_detected() {
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");
        let expected = LocalIdentity::generate("carol").peer_id();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let dial = tokio::spawn(async move { handshake_initiator(&mut a, &alice, expected).await });
        read_hello(&mut b).await.unwrap();
        answer_hello(&mut b, &bob, true).await.unwrap();
        assert!(matches!(
            dial.await.unwrap(),
            Err(ConnectionError::IdentityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn forged_hello_rejected() {
        let mallory = LocalIdentity::generate("mallory");
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_plain(
            &mut a,
            &Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                peer_id: PeerId::from_bytes([0; 16]),
                public_key: mallory.keypair().public_key().clone(),
                display_name: "not-mallory".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            read_hello(&mut b).await,
            Err(ConnectionError::IdentityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn eof_is_closed_by_peer() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        assert_eq!(
            read_plain(&mut b).await.unwrap_err(),
            TransportError::ClosedByPeer
        );
    }
}
