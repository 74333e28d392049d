use bytes::{Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not a failure when decoding from a live stream: keep the buffer and
    /// wait for the next chunk. A hard error when decoding a bounded payload.
    #[error("need more data")]
    NeedMoreData,
    #[error("malformed varint (no terminator within 5 bytes)")]
    MalformedVarint,
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Decode a Minecraft VarInt from the front of `buf`.
///
/// Returns the value and the number of bytes consumed. At most 5 bytes are
/// scanned; a 5th byte with the continuation bit still set is malformed.
pub fn read_varint(buf: &[u8]) -> Result<(i32, usize), DecodeError> {
    let mut result: i32 = 0;
    let mut num_read = 0usize;

    loop {
        if num_read >= buf.len() {
            return Err(DecodeError::NeedMoreData);
        }
        let read = buf[num_read];

        let value = (read & 0x7F) as i32;
        result |= value << (7 * num_read);

        num_read += 1;
        if (read & 0x80) == 0 {
            return Ok((result, num_read));
        }
        if num_read == 5 {
            return Err(DecodeError::MalformedVarint);
        }
    }
}

/// Encode `v` as a VarInt. Exact inverse of [`read_varint`].
pub fn write_varint(mut v: i32, out: &mut Vec<u8>) {
    loop {
        let mut temp = (v & 0x7F) as u8;
        v = ((v as u32) >> 7) as i32;
        if v != 0 {
            temp |= 0x80;
        }
        out.push(temp);
        if v == 0 {
            break;
        }
    }
}

/// One complete length-prefixed protocol message.
///
/// `raw` holds the frame exactly as it arrived, length prefix included, so
/// forwarding never re-encodes. `body()` is everything after the prefix;
/// decoding the packet id from its front is the inspector's job.
#[derive(Debug, Clone)]
pub struct Frame {
    raw: Bytes,
    body_offset: usize,
}

impl Frame {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn body(&self) -> &[u8] {
        &self.raw[self.body_offset..]
    }

    #[cfg(test)]
    pub fn from_parts(raw: Vec<u8>, body_offset: usize) -> Self {
        Self {
            raw: Bytes::from(raw),
            body_offset,
        }
    }
}

/// Stateful per-connection frame decoder over an append-only buffer.
///
/// Incomplete frames (short length varint or short body) are held back
/// untouched until more bytes arrive; the yielded frame order is independent
/// of how the stream was chunked.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Try to slice one complete frame off the front of the buffer.
    ///
    /// `Ok(None)` means the buffer holds only an incomplete tail; call again
    /// after the next `extend`. Call in a loop after each chunk since one
    /// chunk may complete several frames.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let (pkt_len, len_n) = match read_varint(&self.buf) {
            Ok(v) => v,
            Err(DecodeError::NeedMoreData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if pkt_len < 0 {
            return Err(DecodeError::MalformedPacket(format!(
                "negative frame length {pkt_len}"
            )));
        }
        let pkt_len = pkt_len as usize;
        if pkt_len > self.max_frame_len {
            return Err(DecodeError::MalformedPacket(format!(
                "frame too large ({pkt_len} > {})",
                self.max_frame_len
            )));
        }

        let total = len_n + pkt_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let raw = self.buf.split_to(total).freeze();
        Ok(Some(Frame {
            raw,
            body_offset: len_n,
        }))
    }
}
