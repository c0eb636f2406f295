//! Parse MP4 sample table boxes (stts, ctts, stss, stsz, stsc, stco, co64)
//! and resolve them into the ordered sample index.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use rp_core::Sample;

use super::atoms::{
    find_child_box, read_entry_count, read_fullbox_header, read_i32, read_u32, read_u64,
    require_child_box,
};
use crate::error::{DemuxError, Result};

/// (count, delta) pair from stts.
struct SttsEntry {
    count: u32,
    delta: u32,
}

/// (count, offset) pair from ctts.
struct CttsEntry {
    count: u32,
    offset: i32,
}

/// (first_chunk, samples_per_chunk) from stsc.
struct StscEntry {
    first_chunk: u32,
    samples_per_chunk: u32,
}

fn parse_stts<R: Read>(reader: &mut R, content: u64) -> Result<Vec<SttsEntry>> {
    read_fullbox_header(reader)?;
    let entry_count = read_entry_count(reader, 8, content.saturating_sub(8), "stts")?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let count = read_u32(reader)?;
        let delta = read_u32(reader)?;
        entries.push(SttsEntry { count, delta });
    }
    Ok(entries)
}

fn parse_ctts<R: Read>(reader: &mut R, content: u64) -> Result<Vec<CttsEntry>> {
    let (version, _flags) = read_fullbox_header(reader)?;
    let entry_count = read_entry_count(reader, 8, content.saturating_sub(8), "ctts")?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let count = read_u32(reader)?;
        // Version 0 offsets are nominally unsigned; encoders write negative
        // values either way, so both are read as signed.
        let offset = if version == 0 {
            read_u32(reader)? as i32
        } else {
            read_i32(reader)?
        };
        entries.push(CttsEntry { count, offset });
    }
    Ok(entries)
}

/// Returns 0-based sync sample indices.
fn parse_stss<R: Read>(reader: &mut R, content: u64) -> Result<HashSet<u32>> {
    read_fullbox_header(reader)?;
    let entry_count = read_entry_count(reader, 4, content.saturating_sub(8), "stss")?;
    let mut syncs = HashSet::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        // stss uses 1-based sample numbers.
        let sample_number = read_u32(reader)?;
        let index = sample_number
            .checked_sub(1)
            .ok_or_else(|| DemuxError::malformed("stss references sample number 0"))?;
        syncs.insert(index);
    }
    Ok(syncs)
}

fn parse_stsz<R: Read>(reader: &mut R, content: u64) -> Result<Vec<u32>> {
    read_fullbox_header(reader)?;
    let sample_size = read_u32(reader)?;
    if sample_size != 0 {
        let sample_count = read_u32(reader)?;
        // Fixed-size samples carry no table, so the count is only bounded by
        // what an index can reasonably hold.
        if sample_count > MAX_FIXED_SIZE_SAMPLES {
            return Err(DemuxError::malformed(format!(
                "stsz declares {sample_count} fixed-size samples"
            )));
        }
        return Ok(vec![sample_size; sample_count as usize]);
    }
    let sample_count = read_entry_count(reader, 4, content.saturating_sub(12), "stsz")?;
    let mut sizes = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        sizes.push(read_u32(reader)?);
    }
    Ok(sizes)
}

const MAX_FIXED_SIZE_SAMPLES: u32 = 1 << 24;

fn parse_stsc<R: Read>(reader: &mut R, content: u64) -> Result<Vec<StscEntry>> {
    read_fullbox_header(reader)?;
    let entry_count = read_entry_count(reader, 12, content.saturating_sub(8), "stsc")?;
    let mut entries: Vec<StscEntry> = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let first_chunk = read_u32(reader)?;
        let samples_per_chunk = read_u32(reader)?;
        let _sdi = read_u32(reader)?;
        let ascending = entries.last().map_or(first_chunk >= 1, |prev| first_chunk > prev.first_chunk);
        if !ascending {
            return Err(DemuxError::malformed(format!(
                "stsc first_chunk {first_chunk} out of order"
            )));
        }
        entries.push(StscEntry {
            first_chunk,
            samples_per_chunk,
        });
    }
    Ok(entries)
}

/// Chunk offsets from stco (32-bit) or co64 (64-bit).
fn parse_chunk_offsets<R: Read>(reader: &mut R, content: u64, is_co64: bool) -> Result<Vec<u64>> {
    read_fullbox_header(reader)?;
    let width = if is_co64 { 8 } else { 4 };
    let table = if is_co64 { "co64" } else { "stco" };
    let entry_count = read_entry_count(reader, width, content.saturating_sub(8), table)?;
    let mut offsets = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        if is_co64 {
            offsets.push(read_u64(reader)?);
        } else {
            offsets.push(read_u32(reader)? as u64);
        }
    }
    Ok(offsets)
}

/// Resolve the sample index from the raw stbl box content.
///
/// The reader must be positioned at the start of stbl's content. Samples are
/// returned in decode order with `index` equal to their position.
pub fn resolve_sample_table<R: Read + Seek>(
    reader: &mut R,
    stbl_content_size: u64,
    timescale: u32,
) -> Result<Vec<Sample>> {
    let stbl_start = reader.stream_position()?;

    reader.seek(SeekFrom::Start(stbl_start))?;
    let stts = require_child_box(reader, stbl_content_size, b"stts", "stts")?;
    let stts_entries = parse_stts(reader, stts.content_size())?;

    reader.seek(SeekFrom::Start(stbl_start))?;
    let ctts_entries = match find_child_box(reader, stbl_content_size, b"ctts")? {
        Some(h) => parse_ctts(reader, h.content_size())?,
        None => Vec::new(),
    };

    // Absent stss means every sample is a sync sample.
    reader.seek(SeekFrom::Start(stbl_start))?;
    let sync_set = match find_child_box(reader, stbl_content_size, b"stss")? {
        Some(h) => Some(parse_stss(reader, h.content_size())?),
        None => None,
    };

    reader.seek(SeekFrom::Start(stbl_start))?;
    let stsz = require_child_box(reader, stbl_content_size, b"stsz", "stsz")?;
    let sizes = parse_stsz(reader, stsz.content_size())?;

    reader.seek(SeekFrom::Start(stbl_start))?;
    let stsc = require_child_box(reader, stbl_content_size, b"stsc", "stsc")?;
    let stsc_entries = parse_stsc(reader, stsc.content_size())?;

    reader.seek(SeekFrom::Start(stbl_start))?;
    let chunk_offsets = match find_child_box(reader, stbl_content_size, b"stco")? {
        Some(h) => parse_chunk_offsets(reader, h.content_size(), false)?,
        None => {
            reader.seek(SeekFrom::Start(stbl_start))?;
            match find_child_box(reader, stbl_content_size, b"co64")? {
                Some(h) => parse_chunk_offsets(reader, h.content_size(), true)?,
                None => return Err(DemuxError::MissingBox("stco/co64")),
            }
        }
    };

    let sample_count = sizes.len();
    if sample_count == 0 {
        return Ok(Vec::new());
    }
    if let Some(index) = sizes.iter().position(|&size| size == 0) {
        return Err(DemuxError::inconsistent(format!(
            "sample {index} has zero size"
        )));
    }
    if stsc_entries.is_empty() {
        return Err(DemuxError::inconsistent(format!(
            "{sample_count} samples but stsc is empty"
        )));
    }

    // --- Byte offsets: walk chunks, applying the last stsc entry whose
    // first_chunk <= chunk number (1-based). ---
    let mut offsets = Vec::with_capacity(sample_count);
    let mut stsc_idx = 0usize;
    for (chunk_idx, &chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = chunk_idx as u32 + 1;
        while stsc_idx + 1 < stsc_entries.len()
            && stsc_entries[stsc_idx + 1].first_chunk <= chunk_number
        {
            stsc_idx += 1;
        }
        let mut offset = chunk_offset;
        for _ in 0..stsc_entries[stsc_idx].samples_per_chunk {
            if offsets.len() == sample_count {
                break;
            }
            let size = sizes[offsets.len()] as u64;
            offsets.push(offset);
            // Every sample's last byte must be addressable.
            offset = offset.checked_add(size).ok_or_else(|| {
                DemuxError::inconsistent(format!(
                    "sample {} at offset {} with size {size} overflows u64",
                    offsets.len() - 1,
                    offsets[offsets.len() - 1]
                ))
            })?;
        }
        if offsets.len() == sample_count {
            break;
        }
    }
    if offsets.len() < sample_count {
        return Err(DemuxError::inconsistent(format!(
            "chunks hold {} of {sample_count} samples",
            offsets.len()
        )));
    }

    // --- Decode timestamps from stts ---
    let mut timing = Vec::with_capacity(sample_count);
    let mut dts: u64 = 0;
    'stts: for entry in &stts_entries {
        for _ in 0..entry.count {
            if timing.len() == sample_count {
                break 'stts;
            }
            timing.push((dts, entry.delta));
            dts += entry.delta as u64;
        }
    }
    if timing.len() < sample_count {
        return Err(DemuxError::inconsistent(format!(
            "stts covers {} of {sample_count} samples",
            timing.len()
        )));
    }

    // --- Composition offsets from ctts ---
    let mut cts_offsets = vec![0i32; sample_count];
    let mut i = 0usize;
    for entry in &ctts_entries {
        for _ in 0..entry.count {
            if i == sample_count {
                break;
            }
            cts_offsets[i] = entry.offset;
            i += 1;
        }
    }

    let samples = (0..sample_count)
        .map(|i| {
            let (dts, duration) = timing[i];
            let cts = dts.saturating_add_signed(cts_offsets[i] as i64);
            let index = i as u32;
            Sample {
                index,
                is_key_frame: sync_set.as_ref().map_or(true, |set| set.contains(&index)),
                cts,
                dts,
                duration,
                timescale,
                offset: offsets[i],
                size: sizes[i],
            }
        })
        .collect();

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::fixture::{fullbox_header, write_box};
    use std::io::Cursor;

    fn table(fourcc: &[u8; 4], entries: &[&[u32]]) -> Vec<u8> {
        let mut c = Vec::new();
        c.extend_from_slice(&fullbox_header(0, 0));
        c.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for entry in entries {
            for v in *entry {
                c.extend_from_slice(&v.to_be_bytes());
            }
        }
        write_box(fourcc, &c)
    }

    fn stsz(sizes: &[u32]) -> Vec<u8> {
        let mut c = Vec::new();
        c.extend_from_slice(&fullbox_header(0, 0));
        c.extend_from_slice(&0u32.to_be_bytes());
        c.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        for s in sizes {
            c.extend_from_slice(&s.to_be_bytes());
        }
        write_box(b"stsz", &c)
    }

    fn resolve(stbl_content: &[u8]) -> Result<Vec<Sample>> {
        let mut cursor = Cursor::new(stbl_content);
        resolve_sample_table(&mut cursor, stbl_content.len() as u64, 90000)
    }

    #[test]
    fn resolves_offsets_timing_and_sync() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[4, 1000]]));
        // Samples 1 and 3 (1-based) are sync.
        stbl.extend(table(b"stss", &[&[1], &[3]]));
        stbl.extend(table(b"ctts", &[&[1, 0], &[1, 2000], &[2, 500]]));
        stbl.extend(stsz(&[100, 50, 200, 75]));
        // 2 chunks, 2 samples each.
        stbl.extend(table(b"stsc", &[&[1, 2, 1]]));
        stbl.extend(table(b"stco", &[&[1000], &[2000]]));

        let samples = resolve(&stbl).unwrap();
        assert_eq!(samples.len(), 4);

        let offsets: Vec<u64> = samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![1000, 1100, 2000, 2200]);
        let dts: Vec<u64> = samples.iter().map(|s| s.dts).collect();
        assert_eq!(dts, vec![0, 1000, 2000, 3000]);
        let cts: Vec<u64> = samples.iter().map(|s| s.cts).collect();
        assert_eq!(cts, vec![0, 3000, 2500, 3500]);
        let sync: Vec<bool> = samples.iter().map(|s| s.is_key_frame).collect();
        assert_eq!(sync, vec![true, false, true, false]);

        assert!(samples.iter().enumerate().all(|(i, s)| s.index == i as u32));
        assert!(samples.iter().all(|s| s.timescale == 90000 && s.duration == 1000));
    }

    #[test]
    fn stsc_runs_switch_samples_per_chunk() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[5, 10]]));
        stbl.extend(stsz(&[10, 10, 10, 10, 10]));
        // Chunk 1 holds 3 samples, chunks 2+ hold 1.
        stbl.extend(table(b"stsc", &[&[1, 3, 1], &[2, 1, 1]]));
        stbl.extend(table(b"stco", &[&[100], &[500], &[900]]));

        let samples = resolve(&stbl).unwrap();
        let offsets: Vec<u64> = samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![100, 110, 120, 500, 900]);
        assert!(samples.iter().all(|s| s.is_key_frame));
    }

    #[test]
    fn co64_offsets() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[1, 10]]));
        stbl.extend(stsz(&[8]));
        stbl.extend(table(b"stsc", &[&[1, 1, 1]]));
        stbl.extend(co64(&[5_000_000_000]));

        let samples = resolve(&stbl).unwrap();
        assert_eq!(samples[0].offset, 5_000_000_000);
    }

    fn co64(offsets: &[u64]) -> Vec<u8> {
        let mut c = Vec::new();
        c.extend_from_slice(&fullbox_header(0, 0));
        c.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
        for o in offsets {
            c.extend_from_slice(&o.to_be_bytes());
        }
        write_box(b"co64", &c)
    }

    #[test]
    fn chunk_offset_near_u64_max_is_an_error() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[2, 10]]));
        stbl.extend(stsz(&[100, 100]));
        stbl.extend(table(b"stsc", &[&[1, 2, 1]]));
        stbl.extend(co64(&[u64::MAX - 10]));

        let err = resolve(&stbl).unwrap_err();
        assert!(matches!(err, DemuxError::InconsistentTable(_)));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn zero_size_sample_is_an_error() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[3, 10]]));
        stbl.extend(stsz(&[10, 0, 10]));
        stbl.extend(table(b"stsc", &[&[1, 3, 1]]));
        stbl.extend(table(b"stco", &[&[64]]));

        let err = resolve(&stbl).unwrap_err();
        assert!(err.to_string().contains("sample 1 has zero size"));
    }

    #[test]
    fn empty_stsc_is_an_error() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[2, 10]]));
        stbl.extend(stsz(&[10, 10]));
        stbl.extend(table(b"stsc", &[]));
        stbl.extend(table(b"stco", &[&[0]]));

        assert!(matches!(resolve(&stbl), Err(DemuxError::InconsistentTable(_))));
    }

    #[test]
    fn short_stts_is_an_error() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[1, 10]]));
        stbl.extend(stsz(&[10, 10]));
        stbl.extend(table(b"stsc", &[&[1, 2, 1]]));
        stbl.extend(table(b"stco", &[&[0]]));

        let err = resolve(&stbl).unwrap_err();
        assert!(err.to_string().contains("stts covers 1 of 2"));
    }

    #[test]
    fn chunks_must_cover_all_samples() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[3, 10]]));
        stbl.extend(stsz(&[10, 10, 10]));
        stbl.extend(table(b"stsc", &[&[1, 1, 1]]));
        stbl.extend(table(b"stco", &[&[0], &[10]]));

        assert!(matches!(resolve(&stbl), Err(DemuxError::InconsistentTable(_))));
    }

    #[test]
    fn missing_stsz_is_reported() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[1, 10]]));
        stbl.extend(table(b"stsc", &[&[1, 1, 1]]));
        stbl.extend(table(b"stco", &[&[0]]));

        assert!(matches!(resolve(&stbl), Err(DemuxError::MissingBox("stsz"))));
    }

    #[test]
    fn stss_sample_zero_is_malformed() {
        let mut stbl = Vec::new();
        stbl.extend(table(b"stts", &[&[1, 10]]));
        stbl.extend(table(b"stss", &[&[0]]));
        stbl.extend(stsz(&[10]));
        stbl.extend(table(b"stsc", &[&[1, 1, 1]]));
        stbl.extend(table(b"stco", &[&[0]]));

        assert!(matches!(resolve(&stbl), Err(DemuxError::Malformed(_))));
    }
}
