//! Protocol codec for encoding/decoding envelopes
//!
//! Handles serialization and framing of protocol messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

use super::{Message, Tag, MAGIC_BYTES};

/// Maximum payload size (10 MB)
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(4) + tag(4) + length(4) + sequence(4) = 16 bytes
const HEADER_SIZE: usize = 16;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Incomplete message")]
    Incomplete,
}

/// Envelope with its wire metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number assigned by the sender
    pub sequence: u32,
    pub message: Message,
}

impl Frame {
    pub fn new(sequence: u32, message: Message) -> Self {
        Self { sequence, message }
    }
}

/// Encodes envelopes into the wire format
pub struct Encoder {
    sequence: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Append one framed envelope to `buf`
    pub fn encode(&mut self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&message.body)?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
        }

        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_i32(message.tag.0);
        buf.put_u32(payload.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&payload);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes envelopes from the wire format, one frame at a time
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        tag: Tag,
        length: usize,
        sequence: u32,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let tag = Tag(i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]));
                    let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
                    let sequence = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

                    if length > MAX_MESSAGE_SIZE {
                        return Err(CodecError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
                    }

                    buf.advance(HEADER_SIZE);

                    self.state = DecodeState::Payload {
                        tag,
                        length,
                        sequence,
                    };
                }
                DecodeState::Payload {
                    tag,
                    length,
                    sequence,
                } => {
                    if buf.len() < *length {
                        return Ok(None);
                    }

                    let payload = buf.split_to(*length);
                    let message = Message::new(*tag, serde_json::from_slice(&payload)?);
                    let seq = *sequence;

                    self.state = DecodeState::Header;

                    return Ok(Some(Frame::new(seq, message)));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a single envelope into a standalone frame
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one envelope from a standalone frame
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let mut buf = BytesMut::from(bytes);
    let frame = Decoder::new().decode(&mut buf)?.ok_or(CodecError::Incomplete)?;
    if !buf.is_empty() {
        return Err(CodecError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} trailing bytes after frame", buf.len()),
        )));
    }
    Ok(frame.message)
}
