//! Sample description entries: codec configuration records and the codec
//! strings a decoder is configured with.

use std::fmt::Write as _;
use std::io::{Read, Seek};

use super::atoms::{
    find_child_box, fourcc_str, read_box_header, read_bytes, read_fullbox_header, read_u16,
    read_u32, skip, BoxHeader, FourCC,
};
use crate::error::{DemuxError, Result};

/// Bytes between a visual sample entry's header and its child boxes.
const VISUAL_SAMPLE_ENTRY_LEN: u64 = 78;
/// Bytes between an audio sample entry's header and its child boxes.
const AUDIO_SAMPLE_ENTRY_LEN: u64 = 28;

/// Video codecs that can be configured from a sample entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Avc,
    Hevc,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Map a sample entry code to its codec.
    pub fn from_sample_entry(fourcc: &FourCC) -> Option<Self> {
        match fourcc {
            b"avc1" | b"avc3" => Some(Self::Avc),
            b"hvc1" | b"hev1" => Some(Self::Hevc),
            b"vp09" => Some(Self::Vp9),
            b"av01" => Some(Self::Av1),
            _ => None,
        }
    }

    /// Child box holding the decoder configuration record.
    pub fn config_box(&self) -> &'static FourCC {
        match self {
            Self::Avc => b"avcC",
            Self::Hevc => b"hvcC",
            Self::Vp9 => b"vpcC",
            Self::Av1 => b"av1C",
        }
    }

    fn config_box_name(&self) -> &'static str {
        match self {
            Self::Avc => "avcC",
            Self::Hevc => "hvcC",
            Self::Vp9 => "vpcC",
            Self::Av1 => "av1C",
        }
    }
}

/// First entry of a video track's stsd.
#[derive(Debug, Clone)]
pub struct VisualSampleEntry {
    pub fourcc: FourCC,
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    /// Configuration record with its box header stripped.
    pub config: Vec<u8>,
}

impl VisualSampleEntry {
    /// RFC 6381 codec string for this entry.
    pub fn codec_string(&self) -> Result<String> {
        codec_string(&self.fourcc, self.codec, &self.config)
    }
}

/// First entry of an audio track's stsd.
#[derive(Debug, Clone)]
pub struct AudioSampleEntry {
    pub fourcc: FourCC,
    pub channels: u16,
    pub sample_rate: u32,
    /// esds content (version + flags + ES_Descriptor), when present.
    pub esds: Option<Vec<u8>>,
}

impl AudioSampleEntry {
    /// Codec string, e.g. `mp4a.40.2`. Falls back to the entry code.
    pub fn codec_string(&self) -> String {
        if &self.fourcc == b"mp4a" {
            if let Some((oti, aot)) = self.esds.as_deref().and_then(parse_esds_codec) {
                return match aot {
                    Some(aot) => format!("mp4a.{oti:02x}.{aot}"),
                    None => format!("mp4a.{oti:02x}"),
                };
            }
        }
        fourcc_str(&self.fourcc)
    }
}

/// Position the reader on the first sample entry of an stsd and return its
/// header. The reader must be at the start of stsd content.
fn first_sample_entry<R: Read + Seek>(reader: &mut R, stsd_content_size: u64) -> Result<BoxHeader> {
    read_fullbox_header(reader)?;
    let entry_count = read_u32(reader)?;
    if entry_count == 0 {
        return Err(DemuxError::malformed("stsd has no sample entries"));
    }
    let mut header = read_box_header(reader)?.ok_or(DemuxError::MissingBox("sample entry"))?;
    let available = stsd_content_size.saturating_sub(8);
    if header.size == 0 {
        header.size = available;
    }
    if header.size > available {
        return Err(DemuxError::malformed(format!(
            "sample entry '{}' overruns stsd",
            fourcc_str(&header.box_type)
        )));
    }
    Ok(header)
}

/// Read the first visual sample entry of an stsd.
///
/// The reader should be positioned at the start of stsd content.
pub fn read_visual_sample_entry<R: Read + Seek>(
    reader: &mut R,
    stsd_content_size: u64,
) -> Result<VisualSampleEntry> {
    let header = first_sample_entry(reader, stsd_content_size)?;
    let fourcc = header.box_type;
    let codec = VideoCodec::from_sample_entry(&fourcc)
        .ok_or_else(|| DemuxError::UnsupportedCodec(fourcc_str(&fourcc)))?;

    let entry_content = header.content_size();
    if entry_content < VISUAL_SAMPLE_ENTRY_LEN {
        return Err(DemuxError::malformed(format!(
            "visual sample entry '{}' is only {entry_content} bytes",
            fourcc_str(&fourcc)
        )));
    }
    // reserved(6) + data_ref_index(2) + pre_defined/reserved(16)
    skip(reader, 24)?;
    let width = read_u16(reader)?;
    let height = read_u16(reader)?;
    skip(reader, VISUAL_SAMPLE_ENTRY_LEN - 28)?;

    let child_content = entry_content - VISUAL_SAMPLE_ENTRY_LEN;
    let config_header = find_child_box(reader, child_content, codec.config_box())?
        .ok_or(DemuxError::MissingCodecConfig(codec.config_box_name()))?;
    let config = read_bytes(reader, config_header.content_size() as usize)?;

    Ok(VisualSampleEntry {
        fourcc,
        codec,
        width,
        height,
        config,
    })
}

/// Read the first audio sample entry of an stsd.
///
/// The reader should be positioned at the start of stsd content.
pub fn read_audio_sample_entry<R: Read + Seek>(
    reader: &mut R,
    stsd_content_size: u64,
) -> Result<AudioSampleEntry> {
    let header = first_sample_entry(reader, stsd_content_size)?;
    let entry_content = header.content_size();
    if entry_content < AUDIO_SAMPLE_ENTRY_LEN {
        return Err(DemuxError::malformed(format!(
            "audio sample entry '{}' is only {entry_content} bytes",
            fourcc_str(&header.box_type)
        )));
    }

    // reserved(6) + data_ref_index(2) + reserved(8)
    skip(reader, 16)?;
    let channels = read_u16(reader)?;
    // sample_size(2) + pre_defined(2) + reserved(2)
    skip(reader, 6)?;
    let sample_rate = read_u32(reader)? >> 16;

    let esds = if &header.box_type == b"mp4a" {
        let child_content = entry_content - AUDIO_SAMPLE_ENTRY_LEN;
        match find_child_box(reader, child_content, b"esds")? {
            Some(h) => Some(read_bytes(reader, h.content_size() as usize)?),
            None => None,
        }
    } else {
        None
    };

    Ok(AudioSampleEntry {
        fourcc: header.box_type,
        channels,
        sample_rate,
        esds,
    })
}

/// Build the RFC 6381 codec string for a video configuration record.
pub fn codec_string(fourcc: &FourCC, codec: VideoCodec, config: &[u8]) -> Result<String> {
    let prefix = fourcc_str(fourcc);
    let short = |need: usize| {
        DemuxError::malformed(format!(
            "{} record is {} bytes, need {need}",
            codec.config_box_name(),
            config.len()
        ))
    };
    match codec {
        VideoCodec::Avc => {
            // configurationVersion, profile, compatibility, level
            let [_, profile, compat, level] = config.get(..4).ok_or_else(|| short(4))? else {
                return Err(short(4));
            };
            Ok(format!("{prefix}.{profile:02x}{compat:02x}{level:02x}"))
        }
        VideoCodec::Hevc => {
            let record = config.get(..13).ok_or_else(|| short(13))?;
            let space = match record[1] >> 6 {
                0 => "",
                1 => "A",
                2 => "B",
                _ => "C",
            };
            let tier = if record[1] & 0x20 != 0 { 'H' } else { 'L' };
            let profile_idc = record[1] & 0x1F;
            let compat = u32::from_be_bytes([record[2], record[3], record[4], record[5]]).reverse_bits();
            let level = record[12];

            let mut out = format!("{prefix}.{space}{profile_idc}.{compat:X}.{tier}{level}");
            let constraints = &record[6..12];
            let used = constraints.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            for byte in &constraints[..used] {
                let _ = write!(out, ".{byte:X}");
            }
            Ok(out)
        }
        VideoCodec::Vp9 => {
            // vpcC is a full box: version/flags precede the fields.
            let record = config.get(..7).ok_or_else(|| short(7))?;
            let profile = record[4];
            let level = record[5];
            let bit_depth = record[6] >> 4;
            Ok(format!("{prefix}.{profile:02}.{level:02}.{bit_depth:02}"))
        }
        VideoCodec::Av1 => {
            let record = config.get(..3).ok_or_else(|| short(3))?;
            let profile = record[1] >> 5;
            let level = record[1] & 0x1F;
            let tier = if record[2] & 0x80 != 0 { 'H' } else { 'M' };
            let high_bitdepth = record[2] & 0x40 != 0;
            let twelve_bit = record[2] & 0x20 != 0;
            let bit_depth = match (high_bitdepth, twelve_bit) {
                (true, true) => 12,
                (true, false) => 10,
                _ => 8,
            };
            Ok(format!("{prefix}.{profile}.{level:02}{tier}.{bit_depth:02}"))
        }
    }
}

/// Pull (objectTypeIndication, audioObjectType) out of an esds payload.
fn parse_esds_codec(esds: &[u8]) -> Option<(u8, Option<u8>)> {
    // Skip version + flags.
    let mut pos = 4usize;

    let (tag, len, body) = read_descriptor(esds, pos)?;
    if tag != 0x03 {
        return None;
    }
    let es_end = body + len;
    pos = body + 2;
    let flags = *esds.get(pos)?;
    pos += 1;
    if flags & 0x80 != 0 {
        pos += 2;
    }
    if flags & 0x40 != 0 {
        pos += 1 + *esds.get(pos)? as usize;
    }
    if flags & 0x20 != 0 {
        pos += 2;
    }

    let (tag, len, body) = read_descriptor(esds, pos)?;
    if tag != 0x04 || body + len > es_end {
        return None;
    }
    let oti = *esds.get(body)?;
    // objectTypeIndication(1) + streamType(1) + bufferSize(3) + max/avg bitrate(8)
    let specific = body + 13;
    let aot = read_descriptor(esds, specific)
        .filter(|(tag, _, _)| *tag == 0x05)
        .and_then(|(_, _, at)| esds.get(at).map(|b| b >> 3));
    Some((oti, aot))
}

/// Read an MPEG-4 descriptor header at `pos`: (tag, length, body offset).
fn read_descriptor(buf: &[u8], mut pos: usize) -> Option<(u8, usize, usize)> {
    let tag = *buf.get(pos)?;
    pos += 1;
    let mut len = 0usize;
    for _ in 0..4 {
        let b = *buf.get(pos)?;
        pos += 1;
        len = (len << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Some((tag, len, pos))
}
