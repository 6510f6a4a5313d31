//! Wire framing for the peer mesh
//!
//! Every message on a peer stream is a type-length-value frame:
//! - type: 1 byte (0x01 audio, 0x02 text)
//! - length: 4 bytes (big-endian)
//! - payload: `length` bytes

use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::NetworkError;

/// Frame header size in bytes (type + length)
pub const HEADER_LEN: usize = 5;

/// Maximum payload size accepted on either side.
///
/// Audio frames are ~60-120 bytes and text messages a few hundred; anything
/// near this cap is a corrupt or hostile stream, rejected before allocation.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Frame types carried on a peer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// One encoded 20 ms voice frame
    Audio = 0x01,
    /// UTF-8 chat message
    Text = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Audio),
            0x02 => Ok(FrameKind::Text),
            _ => Err(()),
        }
    }
}

/// A single frame bound for every connected peer
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create an audio frame
    pub fn audio(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Audio,
            payload,
        }
    }

    /// Create a text frame
    pub fn text(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Text,
            payload,
        }
    }

    /// Serialize the frame to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read one frame from a peer stream.
///
/// Returns the raw type tag so the caller can skip unknown types without
/// tearing the connection down. Short reads surface as I/O errors and
/// oversized lengths as [`NetworkError::FrameTooLarge`]; both terminate the
/// connection at the call site.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>), NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let tag = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if len > MAX_PAYLOAD_LEN {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok((tag, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::text(b"hello".to_vec());
        let bytes = frame.encode();

        assert_eq!(bytes[0], 0x02);
        assert_eq!(&bytes[1..5], &5u32.to_be_bytes());
        assert_eq!(&bytes[5..], b"hello");
    }

    #[test]
    fn test_encode_audio_tag() {
        let frame = Frame::audio(vec![0xAA; 3]);
        let bytes = frame.encode();

        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes.len(), HEADER_LEN + 3);
    }

    #[test]
    fn test_kind_conversion() {
        assert_eq!(FrameKind::try_from(0x01), Ok(FrameKind::Audio));
        assert_eq!(FrameKind::try_from(0x02), Ok(FrameKind::Text));
        assert_eq!(FrameKind::try_from(0x00), Err(()));
        assert_eq!(FrameKind::try_from(0xFF), Err(()));
    }

    #[tokio::test]
    async fn test_read_frame_roundtrip() {
        let frame = Frame::audio(vec![1, 2, 3, 4, 5]);
        let bytes = frame.encode();

        let mut reader = &bytes[..];
        let (tag, payload) = read_frame(&mut reader).await.expect("Failed to read frame");

        assert_eq!(tag, FrameKind::Audio as u8);
        assert_eq!(payload, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_read_frame_preserves_order() {
        let mut bytes = Frame::text(b"first".to_vec()).encode();
        bytes.extend(Frame::text(b"second".to_vec()).encode());

        let mut reader = &bytes[..];
        let (_, first) = read_frame(&mut reader).await.unwrap();
        let (_, second) = read_frame(&mut reader).await.unwrap();

        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
    }

    #[tokio::test]
    async fn test_read_frame_short_payload_is_error() {
        let mut bytes = Frame::text(b"truncated".to_vec()).encode();
        bytes.truncate(bytes.len() - 2);

        let mut reader = &bytes[..];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let mut bytes = vec![0x02];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());

        let mut reader = &bytes[..];
        match read_frame(&mut reader).await {
            Err(NetworkError::FrameTooLarge(len)) => assert_eq!(len, u32::MAX as usize),
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_zero_payload() {
        let bytes = vec![0x01, 0, 0, 0, 0];

        let mut reader = &bytes[..];
        let (tag, payload) = read_frame(&mut reader).await.unwrap();
        assert_eq!(tag, 0x01);
        assert!(payload.is_empty());
    }
}
