//! Frame encoding and decoding

use bytes::Bytes;
use thiserror::Error;

use super::gzip;

/// Protocol version nibble written into every header
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Size of the fixed header in bytes (one 4-byte word)
pub const HEADER_LEN: usize = 4;

/// Flag bit: a signed sequence number follows the header
pub const FLAG_SEQUENCE: u8 = 0b0001;

/// Flag bit: last packet of the stream
pub const FLAG_LAST: u8 = 0b0010;

/// Errors produced while decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Buffer ended before the field being read
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// Header fields are not usable
    #[error("invalid frame header: {0}")]
    InvalidHeader(&'static str),

    /// Payload claimed to be compressed but could not be inflated
    #[error("payload decompression failed: {0}")]
    Decompress(String),

    /// Compression nibble is not one we understand
    #[error("unsupported compression kind {0:#x}")]
    UnsupportedCompression(u8),
}

/// Message type nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Handshake / control request (`0b0001`)
    FullClientRequest,
    /// Streamed audio input (`0b0010`)
    AudioOnlyRequest,
    /// Recognition result (`0b1001`)
    FullServerResponse,
    /// Synthesized audio (`0b1011`)
    AudioOnlyResponse,
    /// Server-declared error (`0b1111`)
    Error,
    /// Anything else, kept verbatim
    Other(u8),
}

impl MessageType {
    /// Decode from the high nibble of header byte 1
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0f {
            0b0001 => Self::FullClientRequest,
            0b0010 => Self::AudioOnlyRequest,
            0b1001 => Self::FullServerResponse,
            0b1011 => Self::AudioOnlyResponse,
            0b1111 => Self::Error,
            other => Self::Other(other),
        }
    }

    /// Nibble value written on the wire
    #[must_use]
    pub const fn nibble(self) -> u8 {
        match self {
            Self::FullClientRequest => 0b0001,
            Self::AudioOnlyRequest => 0b0010,
            Self::FullServerResponse => 0b1001,
            Self::AudioOnlyResponse => 0b1011,
            Self::Error => 0b1111,
            Self::Other(n) => n & 0x0f,
        }
    }
}

/// Payload serialization nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serialization {
    Raw,
    Json,
    Other(u8),
}

impl Serialization {
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0f {
            0 => Self::Raw,
            1 => Self::Json,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn nibble(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Json => 1,
            Self::Other(n) => n & 0x0f,
        }
    }
}

/// Payload compression nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
    Other(u8),
}

impl Compression {
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0f {
            0 => Self::None,
            1 => Self::Gzip,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn nibble(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Other(n) => n & 0x0f,
        }
    }
}

/// Where the decoder expects the sequence field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceField {
    /// Present only when `FLAG_SEQUENCE` is set (recognition protocol)
    FromFlags,
    /// Always present after the header (synthesis responses)
    Always,
}

/// The fixed 4-byte header, parsed on its own so callers can dispatch on the
/// message type before committing to a payload layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    /// Header size in 4-byte words
    pub words: u8,
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: Compression,
}

impl FrameHeader {
    /// Parse the header at the start of `buf`
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Incomplete` if `buf` is shorter than the declared
    /// header, or `InvalidHeader` if the declared size is zero
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        need(buf, HEADER_LEN)?;

        let words = buf[0] & 0x0f;
        if words == 0 {
            return Err(FrameError::InvalidHeader("header size is zero words"));
        }
        need(buf, usize::from(words) * 4)?;

        Ok(Self {
            version: buf[0] >> 4,
            words,
            message_type: MessageType::from_nibble(buf[1] >> 4),
            flags: buf[1] & 0x0f,
            serialization: Serialization::from_nibble(buf[2] >> 4),
            compression: Compression::from_nibble(buf[2] & 0x0f),
        })
    }

    /// Length of the header in bytes, including extension words
    #[must_use]
    pub const fn len(&self) -> usize {
        self.words as usize * 4
    }

    /// Whether this header marks the final packet of a stream
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub sequence: Option<i32>,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame with a single-word header and no sequence number
    #[must_use]
    pub fn new(
        message_type: MessageType,
        serialization: Serialization,
        compression: Compression,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                words: 1,
                message_type,
                flags: 0,
                serialization,
                compression,
            },
            sequence: None,
            payload: payload.into(),
        }
    }

    /// Attach a sequence number and set the matching flag bit
    #[must_use]
    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.header.flags |= FLAG_SEQUENCE;
        self.sequence = Some(sequence);
        self
    }

    /// Mark this frame as the last packet of its stream
    #[must_use]
    pub fn last(mut self) -> Self {
        self.header.flags |= FLAG_LAST;
        self
    }

    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// A negative sequence number is the end-of-stream marker
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.sequence.is_some_and(i32::is_negative)
    }

    /// Serialize to wire bytes
    ///
    /// Extension header words, if any, are written as zeros.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let header_len = self.header.len();
        let mut out = Vec::with_capacity(header_len + 8 + self.payload.len());

        out.push((self.header.version << 4) | (self.header.words & 0x0f));
        out.push((self.header.message_type.nibble() << 4) | (self.header.flags & 0x0f));
        out.push((self.header.serialization.nibble() << 4) | self.header.compression.nibble());
        out.push(0x00);
        out.resize(header_len, 0x00);

        if let Some(sequence) = self.sequence {
            out.extend_from_slice(&sequence.to_be_bytes());
        }

        // Payloads are bounded by the WebSocket message size; anything past
        // u32::MAX would have been rejected by the transport long before here
        let len = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one frame from `buf`
    ///
    /// Every field is length-checked before it is read. Trailing bytes past the
    /// declared payload are ignored.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Incomplete` when `buf` runs out before a field,
    /// or `InvalidHeader` for a zero-sized header
    pub fn decode(buf: &[u8], layout: SequenceField) -> Result<Self, FrameError> {
        let header = FrameHeader::parse(buf)?;
        let mut offset = header.len();

        let has_sequence = match layout {
            SequenceField::FromFlags => header.flags & FLAG_SEQUENCE != 0,
            SequenceField::Always => true,
        };

        let sequence = if has_sequence {
            need(buf, offset + 4)?;
            let value = i32::from_be_bytes(word(buf, offset));
            offset += 4;
            Some(value)
        } else {
            None
        };

        need(buf, offset + 4)?;
        let payload_len = u32::from_be_bytes(word(buf, offset)) as usize;
        offset += 4;

        need(buf, offset + payload_len)?;
        let payload = Bytes::copy_from_slice(&buf[offset..offset + payload_len]);

        Ok(Self {
            header,
            sequence,
            payload,
        })
    }

    /// Payload after undoing the declared compression
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Decompress` for corrupt gzip data or
    /// `UnsupportedCompression` for an unknown compression nibble
    pub fn decoded_payload(&self) -> Result<Bytes, FrameError> {
        match self.header.compression {
            Compression::None => Ok(self.payload.clone()),
            Compression::Gzip => gzip::decompress(&self.payload).map(Bytes::from),
            Compression::Other(kind) => Err(FrameError::UnsupportedCompression(kind)),
        }
    }
}

/// Per-stream sequence numbering
///
/// Numbers start at 1 and advance once per non-terminal message. The terminal
/// message carries the negation of the next number and does not advance it.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: i32,
}

impl SequenceCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Take the sequence number for the next non-terminal message
    pub const fn advance(&mut self) -> i32 {
        let current = self.next;
        self.next += 1;
        current
    }

    /// Sequence number for the terminal message
    #[must_use]
    pub const fn terminal(&self) -> i32 {
        -self.next
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

const fn need(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::Incomplete {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn word(buf: &[u8], offset: usize) -> [u8; 4] {
    [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]
}
