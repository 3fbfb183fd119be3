//! Length-prefixed message framing for the wire protocol.
//!
//! Every frame is a 4-byte big-endian payload length followed by exactly that
//! many payload bytes. There is no magic number and no version negotiation.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size (4 bytes big-endian length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Codec for encoding/decoding length-prefixed frames.
///
/// Used with [`tokio_util::codec::FramedRead`] and
/// [`tokio_util::codec::FramedWrite`], which take care of looping over short
/// reads and partial writes. If the stream ends partway through a frame, the
/// reader returns an error and drops the partial frame. It never hands out a
/// truncated payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// The largest payload this codec accepts.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn too_large(&self, size: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            },
        )
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            buf.reserve(FRAME_HEADER_SIZE - buf.len());
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;

        if payload_len > self.max_frame_size {
            return Err(self.too_large(payload_len));
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        Ok(Some(buf.split_to(payload_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        payload: Bytes,
        buf: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        let payload_len = payload.len();

        if payload_len > self.max_frame_size {
            return Err(self.too_large(payload_len));
        }
        let length_prefix = u32::try_from(payload_len).map_err(|_| self.too_large(payload_len))?;

        buf.reserve(FRAME_HEADER_SIZE + payload_len);
        buf.put_u32(length_prefix);
        buf.put(payload);

        Ok(())
    }
}
