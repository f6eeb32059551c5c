//! Binary framing shared by the speech recognition and synthesis backends
//!
//! Every message on both WebSocket protocols is a 4-byte header, an optional
//! signed sequence number, a big-endian payload length and the payload:
//!
//! ```text
//!  byte 0          byte 1          byte 2          byte 3
//! ┌───────┬───────┬───────┬───────┬───────┬───────┬───────────────┐
//! │version│ words │ type  │ flags │ serial│ compr │   reserved    │
//! └───────┴───────┴───────┴───────┴───────┴───────┴───────────────┘
//! [ i32 sequence, if flags & 0b0001 ] [ u32 payload length ] [ payload ]
//! ```
//!
//! A negative sequence number marks the last message of a stream in either
//! direction.

mod frame;
pub mod gzip;

pub use frame::{
    Compression, FLAG_LAST, FLAG_SEQUENCE, Frame, FrameError, FrameHeader, HEADER_LEN,
    MessageType, PROTOCOL_VERSION, SequenceCounter, SequenceField, Serialization,
};
