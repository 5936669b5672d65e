//! Wire framing: a 4-byte big-endian length prefix followed by payload bytes.
//!
//! Every distbuild connection — emitter-to-coordinator, emitter-to-absorber,
//! absorber-to-coordinator, collector pushes — uses this same frame shape.
//! What differs per link is the payload codec (see `distbuild_proto`), not
//! the framing.

use bytes::{Bytes, BytesMut};

use crate::buffer::SegmentedBuffer;
use crate::error::{Error, Result};

const LEN_PREFIX_BYTES: usize = 4;

/// Stateful length-prefixed frame decoder.
///
/// Fast path: an entire frame is already buffered, so the payload is sliced
/// out of the underlying `Bytes` with no copy. Slow path: the frame spans
/// multiple reads, so bytes accumulate in `staging` until the declared
/// length is satisfied.
pub struct FrameDecoder {
    max_frame_bytes: usize,
    expected_len: Option<usize>,
    staging: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            expected_len: None,
            staging: BytesMut::new(),
        }
    }

    /// Decode a single frame from `src`.
    ///
    /// Returns `Ok(None)` when more data is needed. Consumes exactly the
    /// bytes that make up a complete frame once one is available.
    ///
    /// # Errors
    ///
    /// Returns `Error::FrameTooLarge` if the declared length exceeds
    /// `max_frame_bytes`, or `Error::Protocol` if the length prefix is
    /// malformed.
    pub fn decode(&mut self, src: &mut SegmentedBuffer) -> Result<Option<Bytes>> {
        if let Some(len) = self.expected_len {
            let needed = len - self.staging.len();
            let take = needed.min(src.len());
            if take > 0 {
                if let Some(bytes) = src.take_bytes(take) {
                    self.staging.extend_from_slice(&bytes);
                }
            }
            if self.staging.len() < len {
                return Ok(None);
            }
            self.expected_len = None;
            return Ok(Some(self.staging.split().freeze()));
        }

        if src.len() < LEN_PREFIX_BYTES {
            return Ok(None);
        }

        let mut hdr = [0u8; LEN_PREFIX_BYTES];
        if !src.copy_prefix(LEN_PREFIX_BYTES, &mut hdr) {
            return Ok(None);
        }
        let len = u32::from_be_bytes(hdr) as usize;

        if len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }

        src.advance(LEN_PREFIX_BYTES);

        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        let take = len.min(src.len());
        if let Some(bytes) = src.take_bytes(take) {
            self.staging.reserve(len);
            self.staging.extend_from_slice(&bytes);
        }

        if self.staging.len() < len {
            self.expected_len = Some(len);
            return Ok(None);
        }

        Ok(Some(self.staging.split().freeze()))
    }
}

/// Encode `payload` with its length prefix into a single contiguous buffer
/// suitable for one `write_all`.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(LEN_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_read() {
        let mut decoder = FrameDecoder::new(1024);
        let encoded = encode_frame(b"hello");
        let mut buf = SegmentedBuffer::new();
        buf.push(encoded.freeze());

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn split_across_reads() {
        let mut decoder = FrameDecoder::new(1024);
        let encoded = encode_frame(b"distbuild");
        let mut buf = SegmentedBuffer::new();

        buf.push(encoded.clone().freeze().slice(0..2));
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.push(encoded.freeze().slice(2..));
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"distbuild");
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut decoder = FrameDecoder::new(4);
        let encoded = encode_frame(b"toolarge");
        let mut buf = SegmentedBuffer::new();
        buf.push(encoded.freeze());

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[test]
    fn empty_payload_frame() {
        let mut decoder = FrameDecoder::new(1024);
        let encoded = encode_frame(b"");
        let mut buf = SegmentedBuffer::new();
        buf.push(encoded.freeze());

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }
}
