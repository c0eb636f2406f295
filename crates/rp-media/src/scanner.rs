//! Locate the `moov` box from the first bytes of a resource.
//!
//! The probe window is scanned byte by byte for either the `moov` or the
//! `mdat` tag; whichever appears first decides the layout. When `mdat` comes
//! first the structural box starts right after it, and its real size is only
//! known once the header at that offset has been fetched
//! ([`refine_after_payload`]).

use rp_core::{BoxLocation, ResourceSize};

use crate::error::{DemuxError, Result};
use crate::mp4::atoms::{fourcc_str, BoxHeader};

/// Order of the structural and payload boxes in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `moov` precedes `mdat` ("fast start").
    MoovFirst,
    /// `mdat` precedes `moov`; the moov location is provisional.
    PayloadFirst,
}

/// Box locations discovered from the probe window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    pub ftyp: BoxLocation,
    pub layout: Layout,
    /// Exact for [`Layout::MoovFirst`]; runs to the end of the resource for
    /// [`Layout::PayloadFirst`] until refined.
    pub moov: BoxLocation,
}

/// Bytes to fetch at a provisional moov start to learn its real size.
pub const REFINE_HEADER_LEN: u64 = 16;

/// Scan `window` (the first bytes of a resource of `total` bytes).
pub fn scan(window: &[u8], total: ResourceSize) -> Result<ScanResult> {
    let ftyp = read_ftyp(window, total)?;

    // A tag needs its 4-byte size field before it.
    let mut i = 4;
    while i + 4 <= window.len() {
        match &window[i..i + 4] {
            b"moov" => {
                let size = declared_size(window, i - 4, b"moov", total)?;
                let moov = BoxLocation::from_size((i - 4) as u64, size)?;
                check_fits(&moov, total, "moov")?;
                tracing::debug!(%moov, "moov precedes mdat");
                return Ok(ScanResult {
                    ftyp,
                    layout: Layout::MoovFirst,
                    moov,
                });
            }
            b"mdat" => {
                let mdat_start = (i - 4) as u64;
                let mdat_size = declared_size(window, i - 4, b"mdat", total)?;
                let moov_start = mdat_start.checked_add(mdat_size).ok_or_else(|| {
                    DemuxError::malformed(format!(
                        "mdat at {mdat_start} declares size {mdat_size} past the addressable range"
                    ))
                })?;
                let last = total.last_byte().unwrap_or(0);
                if moov_start > last {
                    return Err(DemuxError::malformed(format!(
                        "mdat at {mdat_start} spans {mdat_size} bytes, leaving no room for moov in {total}"
                    )));
                }
                let moov = BoxLocation::new(moov_start, last)?;
                tracing::debug!(%moov, "mdat precedes moov; moov location is provisional");
                return Ok(ScanResult {
                    ftyp,
                    layout: Layout::PayloadFirst,
                    moov,
                });
            }
            _ => i += 1,
        }
    }

    Err(DemuxError::MoovNotFound {
        scanned: window.len(),
    })
}

/// Tighten a provisional payload-first moov location using the box header
/// found at its start.
pub fn refine_after_payload(
    header: &[u8],
    provisional: BoxLocation,
    total: ResourceSize,
) -> Result<BoxLocation> {
    let parsed = BoxHeader::parse(header).ok_or_else(|| {
        DemuxError::malformed(format!(
            "only {} header bytes at moov offset {}",
            header.len(),
            provisional.start()
        ))
    })?;
    if &parsed.box_type != b"moov" {
        return Err(DemuxError::malformed(format!(
            "expected moov after mdat at offset {}, found '{}'",
            provisional.start(),
            fourcc_str(&parsed.box_type)
        )));
    }
    let moov = match parsed.size {
        0 => provisional,
        size if size < parsed.header_size => {
            return Err(DemuxError::malformed(format!("moov declares size {size}")));
        }
        size => BoxLocation::from_size(provisional.start(), size)?,
    };
    check_fits(&moov, total, "moov")?;
    Ok(moov)
}

/// Location of the leading file-type box from its size field.
fn read_ftyp(window: &[u8], total: ResourceSize) -> Result<BoxLocation> {
    let Some(size_bytes) = window.get(0..4) else {
        return Err(DemuxError::MoovNotFound {
            scanned: window.len(),
        });
    };
    let size = u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]);
    if size < 8 {
        return Err(DemuxError::malformed(format!(
            "leading box declares size {size}"
        )));
    }
    let ftyp = BoxLocation::from_size(0, size as u64)?;
    check_fits(&ftyp, total, "ftyp")?;
    Ok(ftyp)
}

/// Size of the box whose header starts at `start`, resolving largesize and
/// to-end-of-file encodings.
fn declared_size(window: &[u8], start: usize, tag: &[u8; 4], total: ResourceSize) -> Result<u64> {
    let size32 = u32::from_be_bytes([
        window[start],
        window[start + 1],
        window[start + 2],
        window[start + 3],
    ]);
    let (size, header_len) = match size32 {
        0 => (total.get().saturating_sub(start as u64), 8),
        1 => {
            let ext = window.get(start + 8..start + 16).ok_or_else(|| {
                DemuxError::malformed(format!(
                    "{} largesize at offset {start} lies outside the probe window",
                    fourcc_str(tag)
                ))
            })?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(ext);
            (u64::from_be_bytes(buf), 16)
        }
        n => (n as u64, 8),
    };
    if size < header_len {
        return Err(DemuxError::malformed(format!(
            "{} at offset {start} declares size {size}",
            fourcc_str(tag)
        )));
    }
    Ok(size)
}

fn check_fits(location: &BoxLocation, total: ResourceSize, name: &str) -> Result<()> {
    if !location.fits_within(total) {
        return Err(DemuxError::malformed(format!(
            "{name} at {location} extends past the end of a {total} resource"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::fixture::{write_box, Mp4Fixture};

    fn window(bytes: &[u8]) -> &[u8] {
        &bytes[..bytes.len().min(1024)]
    }

    #[test]
    fn moov_first_exact_range() {
        let file = Mp4Fixture::new(Layout::MoovFirst).build();
        let total = ResourceSize(file.bytes.len() as u64);

        let result = scan(window(&file.bytes), total).unwrap();
        assert_eq!(result.layout, Layout::MoovFirst);
        assert_eq!(result.moov, file.moov);
        assert_eq!(result.ftyp, file.ftyp);
    }

    #[test]
    fn payload_first_provisional_then_refined() {
        let file = Mp4Fixture::new(Layout::PayloadFirst).build();
        let total = ResourceSize(file.bytes.len() as u64);

        let result = scan(window(&file.bytes), total).unwrap();
        assert_eq!(result.layout, Layout::PayloadFirst);
        assert_eq!(result.moov.start(), file.moov.start());
        assert_eq!(result.moov.end(), total.get() - 1);

        let start = result.moov.start() as usize;
        let header = &file.bytes[start..start + REFINE_HEADER_LEN as usize];
        let refined = refine_after_payload(header, result.moov, total).unwrap();
        assert_eq!(refined, file.moov);
    }

    #[test]
    fn payload_first_with_largesize_mdat() {
        let file = Mp4Fixture::new(Layout::PayloadFirst)
            .with_largesize_mdat()
            .build();
        let total = ResourceSize(file.bytes.len() as u64);

        let result = scan(window(&file.bytes), total).unwrap();
        assert_eq!(result.moov.start(), file.moov.start());
    }

    #[test]
    fn neither_tag_is_moov_not_found() {
        let mut bytes = write_box(b"ftyp", b"isom\0\0\x02\0isomiso2");
        bytes.extend(write_box(b"free", &[0u8; 1200]));
        let total = ResourceSize(bytes.len() as u64);

        let err = scan(window(&bytes), total).unwrap_err();
        assert!(matches!(err, DemuxError::MoovNotFound { scanned: 1024 }));
        let core: rp_core::Error = err.into();
        assert_eq!(core.kind(), rp_core::ErrorKind::DemuxError);
    }

    #[test]
    fn tiny_window_is_not_found() {
        let err = scan(&[0, 0], ResourceSize(2)).unwrap_err();
        assert!(matches!(err, DemuxError::MoovNotFound { scanned: 2 }));
    }

    #[test]
    fn moov_larger_than_resource_is_malformed() {
        let mut bytes = write_box(b"ftyp", b"isom\0\0\x02\0");
        bytes.extend_from_slice(&10_000u32.to_be_bytes());
        bytes.extend_from_slice(b"moov");
        bytes.extend_from_slice(&[0u8; 32]);
        let total = ResourceSize(bytes.len() as u64);

        assert!(matches!(
            scan(&bytes, total),
            Err(DemuxError::Malformed(_))
        ));
    }

    /// `ftyp` followed by a largesize `tag` box claiming `u64::MAX` bytes.
    fn with_huge_largesize(tag: &[u8; 4]) -> Vec<u8> {
        let mut bytes = write_box(b"ftyp", b"isom\0\0\x02\0");
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(tag);
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 64]);
        bytes
    }

    #[test]
    fn overflowing_mdat_largesize_is_malformed() {
        let bytes = with_huge_largesize(b"mdat");
        let total = ResourceSize(bytes.len() as u64);
        assert!(matches!(
            scan(&bytes, total),
            Err(DemuxError::Malformed(_))
        ));
    }

    #[test]
    fn overflowing_moov_largesize_is_malformed() {
        let bytes = with_huge_largesize(b"moov");
        let total = ResourceSize(bytes.len() as u64);
        assert!(matches!(
            scan(&bytes, total),
            Err(DemuxError::Malformed(_))
        ));
    }

    #[test]
    fn refine_rejects_overflowing_largesize() {
        let provisional = BoxLocation::new(100, 199).unwrap();
        let mut header = 1u32.to_be_bytes().to_vec();
        header.extend_from_slice(b"moov");
        header.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            refine_after_payload(&header, provisional, ResourceSize(200)),
            Err(DemuxError::Malformed(_))
        ));
    }

    #[test]
    fn refine_rejects_other_box() {
        let provisional = BoxLocation::new(100, 199).unwrap();
        let header = write_box(b"free", &[0u8; 8]);
        let err = refine_after_payload(&header, provisional, ResourceSize(200)).unwrap_err();
        assert!(err.to_string().contains("found 'free'"));
    }

    #[test]
    fn refine_size_zero_runs_to_end() {
        let provisional = BoxLocation::new(100, 199).unwrap();
        let mut header = 0u32.to_be_bytes().to_vec();
        header.extend_from_slice(b"moov");
        let refined = refine_after_payload(&header, provisional, ResourceSize(200)).unwrap();
        assert_eq!(refined, provisional);
    }
}
