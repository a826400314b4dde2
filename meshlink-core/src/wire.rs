//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! One `Message` per frame, so one write on the sending side is exactly one
//! delivered unit on the receiving side.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MeshError;
use crate::protocol::Message;

const LEN_SIZE: usize = 4;
const MAX_ENCODABLE_LEN: usize = u32::MAX as usize;

/// Default upper bound on a frame payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
fn encode_frame(msg: &Message, max: usize) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > max {
        return Err(FrameEncodeError::TooLarge {
            size: payload.len(),
            max,
        });
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
fn decode_frame(bytes: &[u8], max: usize) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max {
        return Err(FrameDecodeError::TooLarge { size: len, max });
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

impl From<FrameEncodeError> for MeshError {
    fn from(err: FrameEncodeError) -> Self {
        match err {
            FrameEncodeError::TooLarge { size, max } => MeshError::FrameTooLarge { size, max },
            FrameEncodeError::Encode(e) => MeshError::Serialization(e.to_string()),
        }
    }
}

/// Stream codec over the frame format, for `FramedRead`/`FramedWrite` on a peer socket.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Limits above `u32::MAX` are clamped; the length prefix is 4 bytes.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_ENCODABLE_LEN),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MeshError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MeshError> {
        match decode_frame(&src[..], self.max_frame_len) {
            Ok((msg, consumed)) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Err(FrameDecodeError::NeedMore) => {
                if src.len() >= LEN_SIZE {
                    let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    src.reserve(LEN_SIZE + len - src.len());
                }
                Ok(None)
            }
            Err(FrameDecodeError::TooLarge { size, max }) => {
                Err(MeshError::FrameTooLarge { size, max })
            }
            Err(FrameDecodeError::Decode(e)) => Err(MeshError::Serialization(e.to_string())),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MeshError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), MeshError> {
        let frame = encode_frame(&msg, self.max_frame_len)?;
        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&Message::Text("hello".into()), DEFAULT_MAX_FRAME_LEN).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2], DEFAULT_MAX_FRAME_LEN),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE], DEFAULT_MAX_FRAME_LEN),
            Err(FrameDecodeError::NeedMore)
        ));
        let (msg, n) = decode_frame(&frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(msg, Message::Text("hello".into()));
    }

    #[test]
    fn multiple_messages() {
        let fa = encode_frame(&Message::Text("a".into()), DEFAULT_MAX_FRAME_LEN).unwrap();
        let fb = encode_frame(&Message::Object(vec![1, 2, 3]), DEFAULT_MAX_FRAME_LEN).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..], DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, Message::Text("a".into()));
        assert_eq!(m2, Message::Object(vec![1, 2, 3]));
    }

    #[test]
    fn oversized_frame_rejected_both_ways() {
        let mut codec = MessageCodec::with_max_frame_len(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Message::Object(vec![0u8; 64]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, MeshError::FrameTooLarge { max: 8, .. }));
        assert!(buf.is_empty());

        buf.put_u32_le(1024);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MeshError::FrameTooLarge { size: 1024, max: 8 })
        ));
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let mut codec = MessageCodec::new();
        let frame = encode_frame(&Message::Text("split".into()), DEFAULT_MAX_FRAME_LEN).unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&frame[frame.len() - 1..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Text("split".into()))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_limit_clamped_to_length_prefix() {
        let codec = MessageCodec::with_max_frame_len(usize::MAX);
        assert_eq!(codec.max_frame_len, u32::MAX as usize);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_slice(&[0xff, 0xff]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MeshError::Serialization(_))
        ));
    }
}
