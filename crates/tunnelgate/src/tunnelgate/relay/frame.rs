//! Length-prefixed framing for the encrypted relay path.
//!
//! ```text
//! [u32 BE length][length bytes of ciphertext]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const LENGTH_PREFIX_BYTES: usize = 4;
pub const MAX_FRAME_BYTES: usize = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0}")]
    TooLarge(usize),
}

pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    let n: u32 = payload.len().try_into().unwrap_or(u32::MAX);
    out.put_u32(n);
    out.put_slice(payload);
    out.freeze()
}

/// Accumulates raw reads and yields complete frames.
///
/// A read may carry part of a frame, exactly one, or several; callers keep
/// calling [`FrameReader::next_frame`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let n = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if n > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(n));
        }
        if self.buf.len() < LENGTH_PREFIX_BYTES + n {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(self.buf.split_to(n).freeze()))
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
