//! Length-prefixed message frames for the client protocol.
//!
//! Every message travels as:
//!
//! ```text
//! +----------+----------+------------------+
//! | Magic(4) | Len(4)   | Payload(Len)     |
//! +----------+----------+------------------+
//! ```
//!
//! The magic's first byte (`0x53`) can never collide with the Raft
//! connection tag (`0x01`), which is how the server's stream layer tells the
//! two protocols apart from the first byte alone.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic number for client protocol frames ("STR1").
pub const FRAME_MAGIC: u32 = 0x53545231;

/// Maximum payload size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header size in bytes (magic + length).
pub const HEADER_SIZE: usize = 4 + 4;

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame did not start with [`FRAME_MAGIC`].
    #[error("invalid frame magic: {0:08x}")]
    BadMagic(u32),

    /// The declared payload length exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// The payload failed to decode as the expected message.
    #[error("frame decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The underlying stream failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for frame operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Encodes a message into a complete frame.
pub fn encode<M: Message>(message: &M) -> FrameResult<Bytes> {
    let payload_len = message.encoded_len();
    if payload_len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload_len));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
    buf.put_u32(FRAME_MAGIC);
    buf.put_u32(payload_len as u32);
    buf.put_slice(&message.encode_to_vec());

    Ok(buf.freeze())
}

/// Checks whether `data` holds a complete frame.
///
/// Returns the total frame size if complete, or `None` if more bytes are
/// needed. Header validation happens in [`decode`].
pub fn frame_size(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_SIZE {
        return None;
    }

    let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let total = HEADER_SIZE + len;

    if data.len() >= total {
        Some(total)
    } else {
        None
    }
}

/// Decodes a complete frame into a message.
pub fn decode<M: Message + Default>(mut data: Bytes) -> FrameResult<M> {
    let magic = data.get_u32();
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }

    let len = data.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let payload = data.slice(..len);
    Ok(M::decode(payload)?)
}

/// Reads the next frame from `reader`, buffering partial input in `buf`.
///
/// Any bytes already in `buf` (for example the byte the stream layer peeked)
/// are treated as the start of the stream. Returns `Ok(None)` on a clean
/// end-of-stream between frames.
pub async fn read_frame<R, M>(reader: &mut R, buf: &mut BytesMut) -> FrameResult<Option<M>>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    loop {
        if let Some(size) = frame_size(buf) {
            if size > HEADER_SIZE + MAX_FRAME_SIZE {
                return Err(FrameError::TooLarge(size - HEADER_SIZE));
            }
            let frame = buf.split_to(size).freeze();
            return decode(frame).map(Some);
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
    }
}

/// Encodes `message` and writes the complete frame to `writer`.
pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{request, ConsumeRequest, Request};

    fn sample_request() -> Request {
        Request {
            identity: "root".to_string(),
            body: Some(request::Body::Consume(ConsumeRequest { offset: 3 })),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let request = sample_request();
        let frame = encode(&request).unwrap();

        assert_eq!(frame_size(&frame), Some(frame.len()));

        let decoded: Request = decode(frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_frame_size_incomplete() {
        let frame = encode(&sample_request()).unwrap();

        assert_eq!(frame_size(&frame[..4]), None);
        assert_eq!(frame_size(&frame[..frame.len() - 1]), None);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xDEADBEEF);
        buf.put_u32(0);

        let result: FrameResult<Request> = decode(buf.freeze());
        assert!(matches!(result, Err(FrameError::BadMagic(_))));
    }

    #[test]
    fn test_first_byte_never_collides_with_raft_tag() {
        let frame = encode(&sample_request()).unwrap();
        assert_ne!(frame[0], 0x01);
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = sample_request();
        write_frame(&mut client, &request).await.unwrap();
        write_frame(&mut client, &request).await.unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        let first: Request = read_frame(&mut server, &mut buf).await.unwrap().unwrap();
        let second: Request = read_frame(&mut server, &mut buf).await.unwrap().unwrap();
        assert_eq!(first, request);
        assert_eq!(second, request);

        let eof: Option<Request> = read_frame(&mut server, &mut buf).await.unwrap();
        assert!(eof.is_none());
    }
}
