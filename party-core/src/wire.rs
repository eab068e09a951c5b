//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! Messages and application bodies share one bincode configuration: varint integers,
//! trailing bytes rejected, size capped at `MAX_FRAME_LEN`.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

/// Encode a message without framing (datagrams, sealed frame contents).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    encode_body(msg)
}

/// Decode a whole unframed message.
pub fn decode_message(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    decode_body(bytes)
}

/// Encode any serializable value with the wire configuration.
pub fn encode_body<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let out = codec().serialize(value).map_err(FrameEncodeError::Encode)?;
    if out.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(out)
}

/// Decode a value encoded with [`encode_body`]. Trailing bytes are an error.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameDecodeError> {
    codec().deserialize(bytes).map_err(FrameDecodeError::Decode)
}

/// Length-prefixed frame holding one message.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_message(msg)?;
    Ok(frame_bytes(&payload))
}

/// Prefix raw bytes with their length.
pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let prefix = (payload.len() as u32).to_le_bytes();
    [prefix.as_slice(), payload].concat()
}

/// Read the length prefix at the front of `bytes`, validating it against the cap.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("cannot encode: {0}")]
    Encode(#[source] bincode::Error),
    #[error("encoded size exceeds the 16 MiB frame limit")]
    TooLarge,
}

/// Take the first frame off `bytes`, returning the message and how many bytes it used.
/// `NeedMore` means the buffer holds only part of a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some(prefix) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = frame_len([prefix[0], prefix[1], prefix[2], prefix[3]])?;
    let end = LEN_SIZE + len;
    let payload = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((decode_message(payload)?, end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("announced length exceeds the 16 MiB frame limit")]
    TooLarge,
    #[error("cannot decode: {0}")]
    Decode(#[source] bincode::Error),
}
