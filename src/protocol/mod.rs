//! The wire format shared by every network transport.
//!
//! Media connections are negotiated over RPC, but the bytes themselves flow
//! over plain sockets framed by the small descriptor defined here. Control
//! messages (credits, cookie probes) and media messages (samples, shared
//! samples) use the same descriptor.

pub mod qos;
pub mod wire;

mod error;
mod types;

use std::io::{Read, Write};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

pub use error::*;
pub use qos::{Qos, QosRequest, QosTag};
pub use types::*;

/// Length in bytes of a connection cookie on the wire: ASCII lowercase hex
/// derived from a UUID, no terminator.
pub const COOKIE_LENGTH: usize = 32;

/// The fixed greeting written by the source side immediately after a cookie
/// match. Must be byte-exact.
pub const CONNECTION_GREETING: &[u8] = b"MEDIABUS CONNECTION ESTABLISHED";

/// Size of the frame descriptor prefixed to every message.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Kinds of messages carried over a data or control channel.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, enum_primitive_derive::Primitive)]
pub enum MessageKind {
    /// A media sample: sample header, extension headers, body bytes.
    Sample = 0,
    /// A media sample whose body may be mapped by reference from a shared
    /// allocator: allocator id + buffer slot, then a regular sample.
    SharedSample = 1,
    /// A back-pressure credit: a count of samples the sink is ready for.
    Credit = 2,
    /// A UDP handshake datagram carrying the connection cookie, so the
    /// source learns the sink's socket addresses.
    CookieProbe = 3,
}

/// Message descriptor / header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// What the payload is.
    pub kind: MessageKind,
    /// Reserved flag bits.
    pub flags: u8,
}

/// Reads a message descriptor from an input stream.
pub fn read_frame_header<R: Read>(r: &mut R) -> Result<FrameHeader, ProtocolError> {
    let length = r.read_u32::<NetworkEndian>()?;
    let kind = r.read_u8()?;
    let flags = r.read_u8()?;
    let _reserved = r.read_u16::<NetworkEndian>()?;

    let kind = MessageKind::from_u8(kind)
        .ok_or_else(|| ProtocolError::Invalid(format!("unknown message kind {kind}")))?;
    if length > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::Invalid(format!(
            "oversized frame: {length} bytes"
        )));
    }

    Ok(FrameHeader {
        length,
        kind,
        flags,
    })
}

/// Writes a message descriptor to an output stream.
pub fn write_frame_header<W: Write>(w: &mut W, header: &FrameHeader) -> Result<(), ProtocolError> {
    w.write_u32::<NetworkEndian>(header.length)?;
    w.write_u8(header.kind as u8)?;
    w.write_u8(header.flags)?;
    w.write_u16::<NetworkEndian>(0)?;

    Ok(())
}

/// Writes a complete message: descriptor plus payload.
pub fn write_message<W: Write>(
    w: &mut W,
    kind: MessageKind,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let length = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    write_frame_header(
        w,
        &FrameHeader {
            length,
            kind,
            flags: 0,
        },
    )?;
    w.write_all(payload)?;

    Ok(())
}

/// Writes a credit message carrying a sample count.
pub fn write_credit_message<W: Write>(w: &mut W, count: u32) -> Result<(), ProtocolError> {
    write_message(w, MessageKind::Credit, &count.to_be_bytes())
}

/// Decodes the payload of a credit message.
pub fn read_credit_payload(payload: &[u8]) -> Result<u32, ProtocolError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| ProtocolError::Invalid(format!("bad credit payload: {} bytes", payload.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Decodes the payload of a cookie probe, validating length and charset.
pub fn read_cookie_payload(payload: &[u8]) -> Result<String, ProtocolError> {
    if payload.len() != COOKIE_LENGTH {
        return Err(ProtocolError::Invalid(format!(
            "bad cookie length: {} bytes",
            payload.len()
        )));
    }
    if !payload
        .iter()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
    {
        return Err(ProtocolError::Invalid("bad cookie charset".to_string()));
    }

    Ok(String::from_utf8(payload.to_vec()).expect("ascii checked above"))
}

/// Mints a fresh one-shot connection cookie: 32 bytes of lowercase hex
/// derived from a random UUID.
pub fn new_cookie() -> String {
    let cookie = uuid::Uuid::new_v4().simple().to_string();
    debug_assert_eq!(cookie.len(), COOKIE_LENGTH);
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_header_roundtrip() {
        let header = FrameHeader {
            length: 1234,
            kind: MessageKind::SharedSample,
            flags: 0,
        };

        let mut buf = Vec::new();
        write_frame_header(&mut buf, &header).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
        assert_eq!(read_frame_header(&mut buf.as_slice()).unwrap(), header);
    }

    #[test]
    fn rejects_unknown_message_kind() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.push(200);
        buf.push(0);
        buf.extend_from_slice(&0u16.to_be_bytes());

        assert!(read_frame_header(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn credit_roundtrip() {
        let mut buf = Vec::new();
        write_credit_message(&mut buf, 25).unwrap();

        let header = read_frame_header(&mut buf.as_slice()).unwrap();
        assert_eq!(header.kind, MessageKind::Credit);
        assert_eq!(header.length, 4);
        assert_eq!(read_credit_payload(&buf[FRAME_HEADER_SIZE..]).unwrap(), 25);
    }

    #[test]
    fn cookies_are_unique_hex() {
        let a = new_cookie();
        let b = new_cookie();

        assert_eq!(a.len(), COOKIE_LENGTH);
        assert_ne!(a, b);
        assert!(read_cookie_payload(a.as_bytes()).is_ok());
        assert!(read_cookie_payload(b"not-a-cookie").is_err());
    }
}
