//! Wire framing: `[4-byte big-endian length][payload]`.
//!
//! [`FrameCodec`] moves raw frames; [`EnvelopeCodec`] layers JSON envelopes
//! on top. Both plug into `tokio_util::codec::{FramedRead, FramedWrite}`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::message::{Envelope, PROTOCOL_VERSION};
use crate::transport::TransportError;

pub const LENGTH_HEADER_LEN: usize = 4;
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn peek_len(src: &BytesMut) -> Option<usize> {
        if src.len() < LENGTH_HEADER_LEN {
            return None;
        }
        let header = [src[0], src[1], src[2], src[3]];
        Some(u32::from_be_bytes(header) as usize)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, TransportError> {
        let Some(len) = Self::peek_len(src) else {
            src.reserve(LENGTH_HEADER_LEN - src.len());
            return Ok(None);
        };
        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let total = LENGTH_HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, TransportError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let expected = match Self::peek_len(src) {
            Some(len) => LENGTH_HEADER_LEN + len,
            None => LENGTH_HEADER_LEN,
        };
        let received = src.len();
        src.clear();
        Err(TransportError::Truncated { expected, received })
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        let len = payload.len();
        if len > self.max_frame_len || u32::try_from(len).is_err() {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        dst.reserve(LENGTH_HEADER_LEN + len);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// JSON envelopes inside length-prefixed frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    frames: FrameCodec,
}

impl EnvelopeCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            frames: FrameCodec::new(max_frame_len),
        }
    }

    fn parse(frame: BytesMut) -> Result<Envelope, TransportError> {
        let text = std::str::from_utf8(&frame)
            .map_err(|e| TransportError::Malformed(format!("payload is not UTF-8: {}", e)))?;
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))?;
        if envelope.version > PROTOCOL_VERSION {
            return Err(TransportError::UnsupportedVersion {
                received: envelope.version,
                supported: PROTOCOL_VERSION,
            });
        }
        Ok(envelope)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, TransportError> {
        self.frames.decode(src)?.map(Self::parse).transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, TransportError> {
        self.frames.decode_eof(src)?.map(Self::parse).transpose()
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = TransportError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), TransportError> {
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| TransportError::Malformed(e.to_string()))?;
        self.frames.encode(Bytes::from(payload), dst)
    }
}
