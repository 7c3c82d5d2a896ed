//! Stream envelopes.
//!
//! ```text
//! +---------------------+------+-------------------+
//! | length (u32 BE)     | kind | body              |
//! +---------------------+------+-------------------+
//! ```
//!
//! The length prefix is handled by `tokio-util`'s `LengthDelimitedCodec`
//! and covers `kind ‖ body`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{FrameRejected, TransportError};
use crate::frame::{Frame, MIN_FRAME_LEN};
use crate::handshake::Hello;

/// Maximum envelope size in bytes (16 MiB).
pub const MAX_ENVELOPE_LEN: usize = 16 * 1024 * 1024;

/// Smallest envelope that can carry a frame.
pub const MIN_FRAME_ENVELOPE_LEN: usize = 1 + MIN_FRAME_LEN;

/// Largest plaintext that fits in one frame envelope.
pub const MAX_PAYLOAD_LEN: usize = MAX_ENVELOPE_LEN - MIN_FRAME_ENVELOPE_LEN;

/// Envelope carrying a [`Hello`].
pub const KIND_HELLO: u8 = 0x01;
/// Envelope carrying a [`Frame`].
pub const KIND_FRAME: u8 = 0x02;
/// Orderly session close.
pub const KIND_GOODBYE: u8 = 0x03;

/// A decoded stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Handshake hello.
    Hello(Hello),
    /// Session frame.
    Frame(Frame),
    /// The sender is closing the session.
    Goodbye,
}

impl Envelope {
    /// Kind byte.
    #[must_use]
    pub const fn kind(&self) -> u8 {
        match self {
            Self::Hello(_) => KIND_HELLO,
            Self::Frame(_) => KIND_FRAME,
            Self::Goodbye => KIND_GOODBYE,
        }
    }

    /// `kind ‖ body`, ready for the length-delimited codec.
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let mut out = BytesMut::new();
        out.put_u8(self.kind());
        match self {
            Self::Hello(hello) => out.extend_from_slice(&hello.to_bytes()?),
            Self::Frame(frame) => {
                out.reserve(frame.encoded_len());
                out.extend_from_slice(&frame.to_bytes());
            },
            Self::Goodbye => {},
        }
        Ok(out.freeze())
    }

    /// Parses `kind ‖ body`.
    ///
    /// # Errors
    ///
    /// [`FrameRejected::MalformedPayload`] for an unknown kind or a body that
    /// does not parse.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameRejected> {
        let Some((&kind, body)) = bytes.split_first() else {
            return Err(FrameRejected::MalformedPayload);
        };
        match kind {
            KIND_HELLO => Hello::from_bytes(body)
                .map(Self::Hello)
                .map_err(|_| FrameRejected::MalformedPayload),
            KIND_FRAME => Frame::from_bytes(body).map(Self::Frame),
            KIND_GOODBYE if body.is_empty() => Ok(Self::Goodbye),
            _ => Err(FrameRejected::MalformedPayload),
        }
    }
}

/// Length-delimited codec with the given size cap.
#[must_use]
pub fn codec(max_envelope_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_envelope_len)
        .new_codec()
}
