//! RFC 6587 octet-counted framing for syslog transport streams.
//!
//! Each frame is `MSG-LEN SP MSG`, where MSG-LEN is the decimal byte length
//! of the message that follows. The codec plugs into
//! `tokio_util::codec::{FramedRead, FramedWrite}` on the ingest listener and
//! is reused to frame messages on API response bodies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;

/// Upper bound on a single framed message.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// A length header longer than this cannot describe a legal frame.
const MAX_LEN_DIGITS: usize = 10;

/// Errors from the octet-counted framing layer. Framing errors are fatal to
/// the connection they occur on.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame length header")]
    InvalidLength,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLong(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Octet-counted frame codec. Decodes to the raw message bytes; parsing the
/// syslog header is the caller's concern.
#[derive(Debug, Default, Clone, Copy)]
pub struct OctetCountedCodec;

impl Decoder for OctetCountedCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(digits) = src
            .iter()
            .take(MAX_LEN_DIGITS + 1)
            .position(|&b| b == b' ')
        else {
            if src.len() > MAX_LEN_DIGITS {
                return Err(FrameError::InvalidLength);
            }
            return Ok(None);
        };
        if digits == 0 {
            return Err(FrameError::InvalidLength);
        }

        let len: usize = std::str::from_utf8(&src[..digits])
            .ok()
            .and_then(|header| header.parse().ok())
            .ok_or(FrameError::InvalidLength)?;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::FrameTooLong(len));
        }

        let frame_end = digits + 1 + len;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(digits + 1);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for OctetCountedCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        put_frame(&item, dst);
        Ok(())
    }
}

/// Frames a single message, for callers that are not driving a `Framed`
/// sink (the API response stream).
pub fn encode_frame(message: &Message) -> Bytes {
    let payload = message.encoded();
    let mut frame = BytesMut::with_capacity(payload.len() + MAX_LEN_DIGITS + 1);
    put_frame(&payload, &mut frame);
    frame.freeze()
}

fn put_frame(payload: &Bytes, dst: &mut BytesMut) {
    let header = payload.len().to_string();
    dst.reserve(header.len() + 1 + payload.len());
    dst.put_slice(header.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(payload);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut OctetCountedCodec, src: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(src).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_single_frame() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b"5 hello"[..]);

        let frames = decode_all(&mut codec, &mut src);

        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b"3 one3 two"[..]);

        let frames = decode_all(&mut codec, &mut src);

        assert_eq!(
            frames,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[test]
    fn test_decode_waits_for_partial_frame() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b"11 split "[..]);

        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(b"frame");
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame, Bytes::from_static(b"split frame"));
    }

    #[test]
    fn test_decode_waits_for_partial_header() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b"12"[..]);

        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_non_numeric_header() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b"abc hello"[..]);

        assert!(matches!(
            codec.decode(&mut src),
            Err(FrameError::InvalidLength)
        ));
    }

    #[test]
    fn test_decode_rejects_missing_header() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b" hello"[..]);

        assert!(matches!(
            codec.decode(&mut src),
            Err(FrameError::InvalidLength)
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b"99999999 x"[..]);

        assert!(matches!(
            codec.decode(&mut src),
            Err(FrameError::FrameTooLong(99_999_999))
        ));
    }

    #[test]
    fn test_decode_rejects_runaway_header() {
        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&b"123456789012345"[..]);

        assert!(matches!(
            codec.decode(&mut src),
            Err(FrameError::InvalidLength)
        ));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = OctetCountedCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"<134>1 - - web - - - hi"), &mut wire)
            .unwrap();

        assert_eq!(&wire[..], b"23 <134>1 - - web - - - hi");

        let frame = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame, Bytes::from_static(b"<134>1 - - web - - - hi"));
    }

    #[test]
    fn test_encode_frame_matches_codec() {
        let message = Message::new("web", "hello");
        let framed = encode_frame(&message);

        let mut codec = OctetCountedCodec;
        let mut src = BytesMut::from(&framed[..]);
        let frame = codec.decode(&mut src).unwrap().unwrap();

        assert_eq!(frame, message.encoded());
    }
}
