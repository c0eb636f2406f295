//! ISO BMFF box header parsing and navigation.
//!
//! Every reader here works on any `Read + Seek`, in practice a
//! `Cursor<&[u8]>` over a fetched byte range. Short reads surface as
//! [`DemuxError::Truncated`].

use std::io::{Read, Seek, SeekFrom};

use crate::error::{DemuxError, Result};

/// Four-character box or sample entry code.
pub type FourCC = [u8; 4];

/// Printable form of a [`FourCC`].
pub fn fourcc_str(code: &FourCC) -> String {
    code.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

/// A parsed box header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxHeader {
    /// 4-byte box type (e.g. b"moov").
    pub box_type: FourCC,
    /// Total size of the box including the header. 0 means "to the end of
    /// the enclosing container".
    pub size: u64,
    /// Size of the header itself (8 or 16 for extended-size boxes).
    pub header_size: u64,
}

impl BoxHeader {
    /// Size of the box content (size - header_size).
    pub fn content_size(&self) -> u64 {
        self.size.saturating_sub(self.header_size)
    }

    /// Parse a header from the start of `buf`.
    ///
    /// Returns `None` when `buf` is too short to hold the header.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let size32 = u32::from_be_bytes(buf.get(0..4)?.try_into().ok()?);
        let box_type: FourCC = buf.get(4..8)?.try_into().ok()?;
        if size32 == 1 {
            let size = u64::from_be_bytes(buf.get(8..16)?.try_into().ok()?);
            return Some(Self {
                box_type,
                size,
                header_size: 16,
            });
        }
        Some(Self {
            box_type,
            size: size32 as u64,
            header_size: 8,
        })
    }

    /// Reject sizes smaller than the header itself.
    fn check(&self) -> Result<()> {
        if self.size != 0 && self.size < self.header_size {
            return Err(DemuxError::malformed(format!(
                "box '{}' declares size {} smaller than its header",
                fourcc_str(&self.box_type),
                self.size
            )));
        }
        Ok(())
    }
}

/// Read a box header from the current position.
///
/// Returns `Ok(None)` when fewer than 8 bytes remain.
pub fn read_box_header<R: Read>(reader: &mut R) -> Result<Option<BoxHeader>> {
    let mut buf = [0u8; 8];
    match reader.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let box_type = [buf[4], buf[5], buf[6], buf[7]];

    let header = if size32 == 1 {
        BoxHeader {
            box_type,
            size: read_u64(reader)?,
            header_size: 16,
        }
    } else {
        BoxHeader {
            box_type,
            size: size32 as u64,
            header_size: 8,
        }
    };
    header.check()?;
    Ok(Some(header))
}

/// Search for a child box with the given type within `parent_content_size`
/// bytes of the current position.
///
/// If found, the reader is positioned at the start of the child's content
/// (just past its header) and the child's header is returned with a
/// concrete size. A child that overruns its parent is malformed.
pub fn find_child_box<R: Read + Seek>(
    reader: &mut R,
    parent_content_size: u64,
    target: &FourCC,
) -> Result<Option<BoxHeader>> {
    let start = reader.stream_position()?;
    let end = start + parent_content_size;

    let mut pos = start;
    while end.saturating_sub(pos) >= 8 {
        reader.seek(SeekFrom::Start(pos))?;
        let Some(mut header) = read_box_header(reader)? else {
            return Ok(None);
        };
        let remaining = end - pos;
        if header.size == 0 {
            header.size = remaining;
        }
        if header.size > remaining {
            return Err(DemuxError::malformed(format!(
                "box '{}' at offset {pos} declares {} bytes but its parent has {remaining} left",
                fourcc_str(&header.box_type),
                header.size
            )));
        }
        if &header.box_type == target {
            return Ok(Some(header));
        }
        pos += header.size;
    }

    Ok(None)
}

/// Like [`find_child_box`], but a missing child is an error.
pub fn require_child_box<R: Read + Seek>(
    reader: &mut R,
    parent_content_size: u64,
    target: &'static FourCC,
    name: &'static str,
) -> Result<BoxHeader> {
    find_child_box(reader, parent_content_size, target)?.ok_or(DemuxError::MissingBox(name))
}

/// Advance the reader by `n` bytes.
pub fn skip<R: Seek>(reader: &mut R, n: u64) -> Result<()> {
    reader.seek(SeekFrom::Current(n as i64))?;
    Ok(())
}

/// Read a single byte.
pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Read a big-endian u16.
pub fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Read a big-endian u32.
pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Read a big-endian i32.
pub fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// Read a big-endian u64.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Read a 4-character code.
pub fn read_fourcc<R: Read>(reader: &mut R) -> Result<FourCC> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read `n` bytes into a new Vec. `n` must already be bounded by an
/// enclosing box size.
pub fn read_bytes<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a fullbox header (1 byte version + 3 bytes flags) and return (version, flags).
pub fn read_fullbox_header<R: Read>(reader: &mut R) -> Result<(u8, u32)> {
    let val = read_u32(reader)?;
    let version = (val >> 24) as u8;
    let flags = val & 0x00FF_FFFF;
    Ok((version, flags))
}

/// Read a table's entry count and check that `count * entry_size` bytes fit
/// in `available`. Guards allocations against corrupt counts.
pub fn read_entry_count<R: Read>(
    reader: &mut R,
    entry_size: u64,
    available: u64,
    table: &'static str,
) -> Result<u32> {
    let count = read_u32(reader)?;
    if (count as u64).saturating_mul(entry_size) > available {
        return Err(DemuxError::malformed(format!(
            "{table} declares {count} entries but holds only {available} bytes"
        )));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::fixture::{write_box, write_container_box};
    use std::io::Cursor;

    #[test]
    fn compact_header_from_reader_and_slice() {
        let moov = write_box(b"moov", &[0u8; 92]);
        let header = read_box_header(&mut Cursor::new(&moov[..]))
            .unwrap()
            .unwrap();
        assert_eq!(
            (header.box_type, header.size, header.header_size),
            (*b"moov", 100, 8)
        );
        assert_eq!(header.content_size(), 92);
        assert_eq!(BoxHeader::parse(&moov[..8]), Some(header));
    }

    #[test]
    fn largesize_mdat_header() {
        let mut data = 1u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&5_000_000_000u64.to_be_bytes());

        let header = read_box_header(&mut Cursor::new(&data[..]))
            .unwrap()
            .unwrap();
        assert_eq!((header.size, header.header_size), (5_000_000_000, 16));
        assert_eq!(BoxHeader::parse(&data), Some(header));
        // Only the 32-bit part is visible: not enough to decide.
        assert_eq!(BoxHeader::parse(&data[..8]), None);
    }

    #[test]
    fn truncated_header_is_end_of_input() {
        let mut cursor = Cursor::new(&b"\0\0\0\x10"[..]);
        assert!(read_box_header(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn undersized_box_is_malformed() {
        let mut data = 4u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"free");
        assert!(matches!(
            read_box_header(&mut Cursor::new(&data[..])),
            Err(DemuxError::Malformed(_))
        ));
    }

    #[test]
    fn child_lookup_skips_siblings() {
        let stbl = write_container_box(
            b"stbl",
            &[&write_box(b"stsd", &[0u8; 8]), &write_box(b"stsz", &[0xAA; 12])],
        );
        let mut cursor = Cursor::new(&stbl[..]);
        cursor.set_position(8);

        let header = find_child_box(&mut cursor, stbl.len() as u64 - 8, b"stsz")
            .unwrap()
            .unwrap();
        assert_eq!(header.content_size(), 12);
        assert_eq!(cursor.position(), stbl.len() as u64 - 12);

        cursor.set_position(8);
        let missing = find_child_box(&mut cursor, stbl.len() as u64 - 8, b"stss").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn child_overrunning_parent_is_malformed() {
        let mut data = 64u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"trak");
        data.extend_from_slice(&[0u8; 8]);

        let mut cursor = Cursor::new(&data[..]);
        let err = find_child_box(&mut cursor, data.len() as u64, b"mdia").unwrap_err();
        assert!(err.to_string().contains("'trak'"));
    }

    #[test]
    fn entry_count_is_bounded_by_content() {
        let data = 1_000_000u32.to_be_bytes();
        let mut cursor = Cursor::new(&data[..]);
        assert!(read_entry_count(&mut cursor, 4, 64, "stsz").is_err());
    }

    #[test]
    fn fourcc_display_replaces_binary() {
        assert_eq!(fourcc_str(b"avc1"), "avc1");
        assert_eq!(fourcc_str(&[0, b'a', b'b', 0xFF]), "?ab?");
    }
}
