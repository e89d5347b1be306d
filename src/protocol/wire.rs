//! Wire codecs for sample headers, extension headers and UDP datagram
//! framing.

use std::io::{Read, Write};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use super::{ExtensionHeader, ProtocolError, SampleFlags, SampleHeader};

/// Size of the fixed part of a sample header on the wire.
pub const SAMPLE_HEADER_SIZE: usize = 28;

/// Upper bound on extension headers per sample, to bound untrusted input.
const MAX_EXTENSIONS: u16 = 16;

/// Upper bound on a single extension payload.
const MAX_EXTENSION_LEN: u16 = 1024;

/// Writes a sample header and its extension headers.
pub fn write_sample_header<W: Write>(
    w: &mut W,
    header: &SampleHeader,
    extensions: &[ExtensionHeader],
) -> Result<(), ProtocolError> {
    if extensions.len() > MAX_EXTENSIONS as usize {
        return Err(ProtocolError::Invalid(format!(
            "too many extension headers: {}",
            extensions.len()
        )));
    }

    w.write_u64::<NetworkEndian>(header.timestamp)?;
    w.write_u32::<NetworkEndian>(header.flags.bits())?;
    w.write_u32::<NetworkEndian>(header.major)?;
    w.write_u32::<NetworkEndian>(header.subtype)?;
    w.write_u32::<NetworkEndian>(header.body_size)?;
    w.write_u16::<NetworkEndian>(extensions.len() as u16)?;
    w.write_u16::<NetworkEndian>(0)?;

    for ext in extensions {
        if ext.data.len() > MAX_EXTENSION_LEN as usize {
            return Err(ProtocolError::Invalid(format!(
                "extension header {:#x} too large: {} bytes",
                ext.id,
                ext.data.len()
            )));
        }
        w.write_u32::<NetworkEndian>(ext.id)?;
        w.write_u16::<NetworkEndian>(ext.data.len() as u16)?;
        w.write_all(&ext.data)?;
    }

    Ok(())
}

/// Reads a sample header and its extension headers.
pub fn read_sample_header<R: Read>(
    r: &mut R,
) -> Result<(SampleHeader, Vec<ExtensionHeader>), ProtocolError> {
    let timestamp = r.read_u64::<NetworkEndian>()?;
    let flags = SampleFlags::from_bits_truncate(r.read_u32::<NetworkEndian>()?);
    let major = r.read_u32::<NetworkEndian>()?;
    let subtype = r.read_u32::<NetworkEndian>()?;
    let body_size = r.read_u32::<NetworkEndian>()?;
    let ext_count = r.read_u16::<NetworkEndian>()?;
    let _reserved = r.read_u16::<NetworkEndian>()?;

    if ext_count > MAX_EXTENSIONS {
        return Err(ProtocolError::Invalid(format!(
            "too many extension headers: {ext_count}"
        )));
    }

    let mut extensions = Vec::with_capacity(ext_count as usize);
    for _ in 0..ext_count {
        let id = r.read_u32::<NetworkEndian>()?;
        let len = r.read_u16::<NetworkEndian>()?;
        if len > MAX_EXTENSION_LEN {
            return Err(ProtocolError::Invalid(format!(
                "extension header {id:#x} too large: {len} bytes"
            )));
        }

        let mut data = vec![0; len as usize];
        r.read_exact(&mut data)?;
        extensions.push(ExtensionHeader { id, data });
    }

    Ok((
        SampleHeader {
            timestamp,
            flags,
            major,
            subtype,
            body_size,
        },
        extensions,
    ))
}

/// Size of the per-datagram header of the lossy UDP data path.
pub const DATAGRAM_HEADER_SIZE: usize = 8;

/// Maximum datagram payload after the header; keeps fragments under a
/// conservative path MTU.
pub const DATAGRAM_PAYLOAD_SIZE: usize = 1200;

/// Header prefixed to every datagram on a UDP data socket. A full sample
/// message is split into `frag_count` fragments sharing a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Sample sequence number, increasing by one per sample.
    pub seq: u32,
    /// Index of this fragment within the sample.
    pub frag_index: u16,
    /// Total fragments of the sample.
    pub frag_count: u16,
}

/// Writes a datagram header.
pub fn write_datagram_header<W: Write>(
    w: &mut W,
    header: &DatagramHeader,
) -> Result<(), ProtocolError> {
    w.write_u32::<NetworkEndian>(header.seq)?;
    w.write_u16::<NetworkEndian>(header.frag_index)?;
    w.write_u16::<NetworkEndian>(header.frag_count)?;
    Ok(())
}

/// Reads a datagram header.
pub fn read_datagram_header<R: Read>(r: &mut R) -> Result<DatagramHeader, ProtocolError> {
    let seq = r.read_u32::<NetworkEndian>()?;
    let frag_index = r.read_u16::<NetworkEndian>()?;
    let frag_count = r.read_u16::<NetworkEndian>()?;

    if frag_count == 0 || frag_index >= frag_count {
        return Err(ProtocolError::Invalid(format!(
            "bad fragment numbering {frag_index}/{frag_count}"
        )));
    }

    Ok(DatagramHeader {
        seq,
        frag_index,
        frag_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ext_header, media_type};
    use pretty_assertions::assert_eq;

    #[test]
    fn sample_header_roundtrip() {
        let header = SampleHeader {
            timestamp: 12_345_678_900,
            flags: SampleFlags::KEY_SAMPLE | SampleFlags::DISCONTINUITY,
            major: media_type::VIDEO,
            subtype: 42,
            body_size: 4096,
        };
        let extensions = vec![ExtensionHeader {
            id: ext_header::SESSION_ID,
            data: 7u32.to_be_bytes().to_vec(),
        }];

        let mut buf = Vec::new();
        write_sample_header(&mut buf, &header, &extensions).unwrap();
        assert_eq!(buf.len(), SAMPLE_HEADER_SIZE + 4 + 2 + 4);

        let (decoded, exts) = read_sample_header(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(exts, extensions);
    }

    #[test]
    fn datagram_header_roundtrip() {
        let header = DatagramHeader {
            seq: 9,
            frag_index: 2,
            frag_count: 3,
        };

        let mut buf = Vec::new();
        write_datagram_header(&mut buf, &header).unwrap();
        assert_eq!(buf.len(), DATAGRAM_HEADER_SIZE);
        assert_eq!(read_datagram_header(&mut buf.as_slice()).unwrap(), header);
    }

    #[test]
    fn rejects_bad_fragment_numbering() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes());

        assert!(read_datagram_header(&mut buf.as_slice()).is_err());
    }
}
