//! Length-prefixed framing.
//!
//! Every wire message is a big-endian `u32` payload length followed by
//! exactly that many payload bytes. The decoder consumes nothing until a
//! whole frame is buffered, so it tolerates any read fragmentation.

use crate::codec::Codec;
use crate::error::RpcError;
use bytes::{Buf, BytesMut};
use serde::Serialize;

pub const FRAME_HEADER_LEN: usize = 4;

/// Payload ceiling. A corrupt length word must fail fast instead of looking
/// like a multi-gigabyte allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[inline]
fn header_len(buf: &[u8]) -> usize {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    u32::from_be_bytes(header) as usize
}

/// Serializes `msg` behind a length word, returning the complete frame.
pub fn encode_frame<C: Codec, T: Serialize>(codec: &C, msg: &T) -> Result<Vec<u8>, RpcError> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
    let n = codec
        .encode_into(msg, &mut buf)
        .map_err(|_| RpcError::encode("payload serialization failed"))?;
    if n > MAX_FRAME_LEN {
        return Err(RpcError::framing(format!(
            "payload of {} bytes exceeds frame limit {}",
            n, MAX_FRAME_LEN
        )));
    }
    buf[..FRAME_HEADER_LEN].copy_from_slice(&(n as u32).to_be_bytes());
    Ok(buf)
}

/// Incremental frame extractor for a byte stream.
///
/// Feed chunks of any size; [`next_frame`](Self::next_frame) yields
/// `Ok(None)` until header plus payload are fully buffered, then splits off
/// exactly one payload. A partial frame is never consumed.
pub struct FrameDecoder {
    buf: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(8 * 1024) }
    }

    /// Exposes the accumulation buffer for `AsyncReadExt::read_buf`.
    #[inline]
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    #[inline]
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned as a frame.
    #[inline]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<BytesMut>, RpcError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = header_len(&self.buf);
        if len > MAX_FRAME_LEN {
            return Err(RpcError::framing(format!(
                "frame declares {} bytes, limit {}",
                len, MAX_FRAME_LEN
            )));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            self.buf.reserve(FRAME_HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        return Ok(Some(self.buf.split_to(len)));
    }
}

/// Extracts the payload of a buffer that must hold exactly one frame.
///
/// This is the read-to-EOF path: a declared length that does not match the
/// bytes actually carried (truncated or trailing) is fatal.
pub fn decode_single(buf: &[u8]) -> Result<&[u8], RpcError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(RpcError::framing(format!(
            "stream ended inside the frame header ({} bytes)",
            buf.len()
        )));
    }
    let len = header_len(buf);
    if len > MAX_FRAME_LEN {
        return Err(RpcError::framing(format!("frame declares {} bytes, limit {}", len, MAX_FRAME_LEN)));
    }
    let payload = &buf[FRAME_HEADER_LEN..];
    if payload.len() != len {
        return Err(RpcError::framing(format!(
            "frame declares {} payload bytes, stream carried {}",
            len,
            payload.len()
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgpCodec;
    use crate::message::{Response, Value};

    fn sample_frame() -> (Vec<u8>, Response) {
        let codec = MsgpCodec::default();
        let resp = Response::ok("id-42", Value::from("hello frame"));
        let frame = encode_frame(&codec, &resp).expect("encode");
        (frame, resp)
    }

    #[test]
    fn test_header_layout() {
        let (frame, _) = sample_frame();
        let declared = header_len(&frame);
        assert_eq!(declared, frame.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn test_roundtrip() {
        let codec = MsgpCodec::default();
        let (frame, resp) = sample_frame();
        let mut dec = FrameDecoder::new();
        dec.extend(&frame);
        let payload = dec.next_frame().expect("frame").expect("complete");
        let back: Response = codec.decode(&payload).expect("decode");
        assert_eq!(back, resp);
        assert_eq!(dec.pending(), 0);
        assert!(dec.next_frame().expect("frame").is_none());
    }

    #[test]
    fn test_partial_feed_consumes_nothing() {
        let (frame, _) = sample_frame();
        // every split point, including mid-header
        for split in 0..frame.len() {
            let mut dec = FrameDecoder::new();
            dec.extend(&frame[..split]);
            assert!(dec.next_frame().expect("frame").is_none(), "split {}", split);
            assert_eq!(dec.pending(), split, "split {}", split);
            dec.extend(&frame[split..]);
            assert!(dec.next_frame().expect("frame").is_some(), "split {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let (frame, _) = sample_frame();
        let mut dec = FrameDecoder::new();
        let mut frames = 0;
        for (i, b) in frame.iter().enumerate() {
            dec.extend(&[*b]);
            if let Some(_) = dec.next_frame().expect("frame") {
                frames += 1;
                assert_eq!(i, frame.len() - 1);
            }
        }
        assert_eq!(frames, 1);
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = MsgpCodec::default();
        let a = encode_frame(&codec, &Response::ok("a", Value::from(1))).expect("encode");
        let b = encode_frame(&codec, &Response::ok("b", Value::from(2))).expect("encode");
        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let mut dec = FrameDecoder::new();
        dec.extend(&joined);
        let first: Response =
            codec.decode(&dec.next_frame().expect("frame").expect("first")).expect("decode");
        let second: Response =
            codec.decode(&dec.next_frame().expect("frame").expect("second")).expect("decode");
        assert_eq!(first.request_id, "a");
        assert_eq!(second.request_id, "b");
        assert!(dec.next_frame().expect("frame").is_none());
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn test_oversize_header_rejected() {
        let mut dec = FrameDecoder::new();
        dec.extend(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert!(matches!(dec.next_frame(), Err(RpcError::Framing(_))));
    }

    #[test]
    fn test_decode_single() {
        let (frame, _) = sample_frame();
        assert!(decode_single(&frame).is_ok());
        // truncated payload
        assert!(matches!(decode_single(&frame[..frame.len() - 1]), Err(RpcError::Framing(_))));
        // trailing bytes
        let mut long = frame.clone();
        long.push(0);
        assert!(matches!(decode_single(&long), Err(RpcError::Framing(_))));
        // inside the header
        assert!(matches!(decode_single(&frame[..2]), Err(RpcError::Framing(_))));
    }
}
