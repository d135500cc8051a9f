//! JSON stream codec.
//!
//! Frames are self-delimiting JSON documents written back-to-back:
//! ```text
//! {"id":"1","type":"PING"}\n{"id":"2","type":"LIST_CONTAINERS"}\n...
//! ```
//! The encoder appends a newline after each document for readability, but the
//! decoder does not depend on it: whitespace between documents is skipped and
//! a document may arrive split across any number of reads.
//!
//! A document that is not valid JSON (or does not match the expected shape)
//! is fatal. There is no resynchronization: once the byte stream contains a
//! malformed frame the position of the next frame boundary is unknown.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum size of a single buffered frame (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(serde_json::Error),

    #[error("Stream ended inside a frame ({0} bytes pending)")]
    Truncated(usize),

    #[error("Frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("Failed to encode frame: {0}")]
    Encode(serde_json::Error),
}

impl CodecError {
    /// Whether the error came from the bytes themselves rather than the pipe.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::Truncated(_) | Self::FrameTooLarge { .. }
        )
    }
}

/// Decodes `D` frames and encodes any serializable value.
pub struct JsonCodec<D> {
    _marker: PhantomData<fn() -> D>,
}

impl<D> JsonCodec<D> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<D> Default for JsonCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Clone for JsonCodec<D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned> Decoder for JsonCodec<D> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, CodecError> {
        // Skip inter-frame whitespace
        let Some(start) = src.iter().position(|b| !b.is_ascii_whitespace()) else {
            src.clear();
            return Ok(None);
        };
        src.advance(start);

        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<D>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(frame)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge {
                        max: MAX_FRAME_SIZE,
                    });
                }
                // Need more bytes
                Ok(None)
            }
            Some(Err(e)) => Err(CodecError::Malformed(e)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<D>, CodecError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Truncated(buf.len())),
        }
    }
}

impl<D, T: Serialize> Encoder<T> for JsonCodec<D> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        serde_json::to_writer((&mut *dst).writer(), &item).map_err(CodecError::Encode)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Request, Response};
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_back_to_back_without_newlines() {
        let mut codec = JsonCodec::<Request>::new();
        let mut buf = BytesMut::from(
            &br#"{"id":"a","type":"PING"}{"id":"b","type":"LIST_CONTAINERS"}"#[..],
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(second.id, "b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = JsonCodec::<Response>::new();
        let mut buf = BytesMut::from(&b"  {\"id\":\"1\",\"succ"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ess\":true,\"data\":\"PONG\"}\n");
        let resp = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(resp.id, "1");
        assert!(resp.success);
    }

    #[test]
    fn test_garbage_is_fatal() {
        let mut codec = JsonCodec::<Request>::new();
        let mut buf = BytesMut::from(&b"hello there\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_desync());
    }

    #[test]
    fn test_wrong_shape_is_fatal() {
        let mut codec = JsonCodec::<Request>::new();
        let mut buf = BytesMut::from(&br#"{"id":7,"type":"PING"}"#[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_at_eof() {
        let mut codec = JsonCodec::<Request>::new();
        let mut buf = BytesMut::from(&br#"{"id":"a","ty"#[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::Truncated(_))
        ));

        let mut buf = BytesMut::from(&b"\n\n  "[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = JsonCodec::<Response>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Response::ok_empty("x"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"id\":\"x\",\"success\":true}\n");
    }

    #[tokio::test]
    async fn test_framed_read_over_stream() {
        let bytes: &[u8] =
            b"{\"id\":\"1\",\"type\":\"PING\"}\n{\"id\":\"2\",\"type\":\"START_ENV\",\"payload\":\"abc123\"}\n";
        let mut frames = FramedRead::new(bytes, JsonCodec::<Request>::new());

        let first = frames.next().await.unwrap().unwrap();
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(second.payload, Some(serde_json::json!("abc123")));
        assert!(frames.next().await.is_none());
    }
}
