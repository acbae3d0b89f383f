//! Binary IPC framing (adapter↔debuggee only).
//!
//! Frame layout, bit-exact:
//! `magic(2)=0x44 0x50 | version(1)=0x01 | kind(1) ∈ {1,2} | length(4, BE) |
//! payload(length, UTF-8 JSON)`. Bad magic, an unsupported version or a
//! short read is fatal to the transport carrying the frame.

use std::io::Read;

use bytes::{Buf, BufMut, BytesMut};

use crate::debugger::error::Error;

pub const MAGIC: [u8; 2] = [0x44, 0x50];
pub const VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Event = 1,
    Command = 2,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            1 => Ok(FrameKind::Event),
            2 => Ok(FrameKind::Command),
            other => Err(Error::IpcFrame(format!("unknown frame kind {other}"))),
        }
    }
}

pub fn pack_frame(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(kind as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn unpack_header(header: &[u8]) -> Result<(FrameKind, usize), Error> {
    if header.len() < HEADER_SIZE {
        return Err(Error::IpcFrame(format!(
            "short header: {} bytes",
            header.len()
        )));
    }
    let mut buf = header;
    let mut magic = [0u8; 2];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(Error::IpcFrame(format!(
            "bad magic: {:#04x} {:#04x}",
            magic[0], magic[1]
        )));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(Error::IpcFrame(format!("unsupported version {version}")));
    }
    let kind = FrameKind::from_byte(buf.get_u8())?;
    let length = buf.get_u32() as usize;
    Ok((kind, length))
}

/// Read one full frame from a blocking reader. EOF at a frame boundary is
/// reported as [`Error::ConnectionClosed`]; EOF inside a frame is a frame
/// error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(FrameKind, Vec<u8>), Error> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0usize;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Err(Error::ConnectionClosed);
            }
            return Err(Error::IpcFrame("EOF inside frame header".into()));
        }
        filled += n;
    }
    let (kind, length) = unpack_header(&header)?;
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .map_err(|_| Error::IpcFrame(format!("EOF inside frame payload ({length} bytes)")))?;
    Ok((kind, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_exact_byte_layout() {
        let payload = br#"{"event":"stopped"}"#;
        let frame = pack_frame(FrameKind::Event, payload);
        assert_eq!(&frame[..4], &[0x44, 0x50, 0x01, 0x01]);
        assert_eq!(&frame[4..8], &[0x00, 0x00, 0x00, 0x13]);
        assert_eq!(&frame[8..], payload);
    }

    #[test]
    fn test_round_trip() {
        let payload = br#"{"command":"next"}"#;
        let frame = pack_frame(FrameKind::Command, payload);
        let (kind, decoded) = read_frame(&mut Cursor::new(frame)).unwrap();
        assert_eq!(kind, FrameKind::Command);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut frame = pack_frame(FrameKind::Event, b"{}");
        frame[0] = 0x45;
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, Error::IpcFrame(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut frame = pack_frame(FrameKind::Event, b"{}");
        frame[2] = 0x02;
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, Error::IpcFrame(_)));
    }

    #[test]
    fn test_short_read_is_fatal() {
        let frame = pack_frame(FrameKind::Event, b"{\"a\":1}");
        let truncated = &frame[..frame.len() - 2];
        let err = read_frame(&mut Cursor::new(truncated.to_vec())).unwrap_err();
        assert!(matches!(err, Error::IpcFrame(_)));
    }

    #[test]
    fn test_eof_at_boundary_is_closed() {
        let err = read_frame(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
