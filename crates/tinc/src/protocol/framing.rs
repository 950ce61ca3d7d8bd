// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame and handshake byte layout.
//!
//! Frames are an 8-byte little-endian length followed by that many
//! envelope bytes. The handshake precedes all framing: the initiator
//! sends `[0x01][ver: u16 LE][rev: u16 LE]`, the responder answers
//! `[0x02][ver: u16 LE][rev: u16 LE]`.

use crate::error::TincError;
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX: usize = 8;

/// Handshake blob size: marker byte + version + revision.
pub const HANDSHAKE_LEN: usize = 5;

/// Frame size guard; anything larger is a protocol error.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Handshake marker sent by the connecting side.
pub const HANDSHAKE_INITIATE: u8 = 0x01;

/// Handshake marker sent by the accepting side.
pub const HANDSHAKE_ACK: u8 = 0x02;

/// Prefix `envelope` bytes with the frame length.
pub fn frame(envelope: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; LENGTH_PREFIX + envelope.len()];
    LittleEndian::write_u64(&mut buf[..LENGTH_PREFIX], envelope.len() as u64);
    buf[LENGTH_PREFIX..].copy_from_slice(envelope);
    buf
}

/// Peel one complete frame off the front of `buf`, if present.
///
/// Used by callers that accumulate reads into a buffer; the async
/// read path below is equivalent but reads exactly one frame.
pub fn peel_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, TincError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = LittleEndian::read_u64(&buf[..LENGTH_PREFIX]);
    if len > MAX_FRAME_SIZE {
        return Err(TincError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        )));
    }
    let total = LENGTH_PREFIX + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let frame = buf[LENGTH_PREFIX..total].to_vec();
    buf.drain(..total);
    Ok(Some(frame))
}

/// Read one frame's envelope bytes from the stream.
///
/// Returns `Ok(None)` when the peer closed the connection at a frame
/// boundary.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>, TincError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TincError::Io(e)),
    }

    let len = LittleEndian::read_u64(&len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(TincError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        )));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Encode a handshake blob.
pub fn handshake(marker: u8, version: u16, revision: u16) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = marker;
    LittleEndian::write_u16(&mut buf[1..3], version);
    LittleEndian::write_u16(&mut buf[3..5], revision);
    buf
}

/// Parse a handshake blob, checking the expected marker byte.
pub fn parse_handshake(buf: &[u8; HANDSHAKE_LEN], expected_marker: u8) -> Result<(u16, u16), TincError> {
    if buf[0] != expected_marker {
        return Err(TincError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "bad handshake marker: expected 0x{:02x}, got 0x{:02x}",
                expected_marker, buf[0]
            ),
        )));
    }
    let version = LittleEndian::read_u16(&buf[1..3]);
    let revision = LittleEndian::read_u16(&buf[3..5]);
    Ok((version, revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PROTOCOL_REVISION, PROTOCOL_VERSION};

    #[test]
    fn test_frame_roundtrip() {
        let payload = b"hello envelope".to_vec();
        let framed = frame(&payload);
        assert_eq!(framed.len(), LENGTH_PREFIX + payload.len());

        let mut buf = framed;
        let peeled = peel_frame(&mut buf).unwrap().unwrap();
        assert_eq!(peeled, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_peel_incomplete() {
        let payload = b"0123456789".to_vec();
        let framed = frame(&payload);

        let mut buf = framed[..framed.len() - 1].to_vec();
        assert!(peel_frame(&mut buf).unwrap().is_none());

        // Length prefix alone is not enough either.
        let mut buf = framed[..LENGTH_PREFIX].to_vec();
        assert!(peel_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_peel_two_frames() {
        let mut buf = frame(b"first");
        buf.extend_from_slice(&frame(b"second"));

        assert_eq!(peel_frame(&mut buf).unwrap().unwrap(), b"first");
        assert_eq!(peel_frame(&mut buf).unwrap().unwrap(), b"second");
        assert!(peel_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_peel_oversized_frame() {
        let mut buf = vec![0u8; LENGTH_PREFIX];
        byteorder::LittleEndian::write_u64(&mut buf, MAX_FRAME_SIZE + 1);
        assert!(peel_frame(&mut buf).is_err());
    }

    #[test]
    fn test_handshake_roundtrip() {
        let blob = handshake(HANDSHAKE_INITIATE, PROTOCOL_VERSION, PROTOCOL_REVISION);
        let (ver, rev) = parse_handshake(&blob, HANDSHAKE_INITIATE).unwrap();
        assert_eq!(ver, PROTOCOL_VERSION);
        assert_eq!(rev, PROTOCOL_REVISION);
    }

    #[test]
    fn test_handshake_wrong_marker() {
        let blob = handshake(HANDSHAKE_ACK, 1, 0);
        assert!(parse_handshake(&blob, HANDSHAKE_INITIATE).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let payload = b"streamed".to_vec();
        let framed = frame(&payload);
        let mut reader = std::io::Cursor::new(framed);

        let got = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(got, payload);

        // EOF at a frame boundary is a clean close.
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }
}
