//! MP4 moov parser.
//!
//! Turns the fetched bytes of a `moov` box into the video track's metadata,
//! decoder configuration and sample index, plus a description of the first
//! audio track.

pub mod atoms;
pub mod codec_config;
pub mod sample_table;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixture;

use std::io::{Cursor, Read, Seek, SeekFrom};

use bytes::Bytes;
use rp_core::{AudioTrackInfo, DecoderConfig, MediaInfo, Sample, VideoMetadata, VideoTrack};

use crate::error::{DemuxError, Result};
use atoms::{
    fourcc_str, read_box_header, read_fourcc, read_fullbox_header, read_u32,
    read_u64, require_child_box, skip, FourCC,
};
use codec_config::{read_audio_sample_entry, read_visual_sample_entry};

/// Parse a complete `moov` box (header included).
pub fn parse_moov(moov: &[u8]) -> Result<MediaInfo> {
    let mut reader = Cursor::new(moov);
    let header = read_box_header(&mut reader)?.ok_or(DemuxError::MissingBox("moov"))?;
    if &header.box_type != b"moov" {
        return Err(DemuxError::malformed(format!(
            "expected moov box, found '{}'",
            fourcc_str(&header.box_type)
        )));
    }
    let available = moov.len() as u64;
    let moov_size = if header.size == 0 { available } else { header.size };
    if moov_size > available {
        return Err(DemuxError::malformed(format!(
            "moov declares {moov_size} bytes but only {available} were fetched"
        )));
    }

    let moov_start = header.header_size;
    let moov_end = moov_size;

    let mut video = None;
    let mut audio = None;

    let mut pos = moov_start;
    while moov_end.saturating_sub(pos) >= 8 {
        reader.seek(SeekFrom::Start(pos))?;
        let Some(mut child) = read_box_header(&mut reader)? else {
            break;
        };
        if child.size == 0 {
            child.size = moov_end - pos;
        }
        if child.size > moov_end - pos {
            return Err(DemuxError::malformed(format!(
                "box '{}' overruns moov",
                fourcc_str(&child.box_type)
            )));
        }

        if &child.box_type == b"trak" {
            let trak_start = reader.stream_position()?;
            let trak = match TrakBoxes::locate(&mut reader, trak_start, child.content_size()) {
                Ok(trak) => trak,
                Err(DemuxError::MissingBox(name)) => {
                    tracing::warn!("Skipping trak without {name}");
                    pos += child.size;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match &trak.handler {
                b"vide" if video.is_none() => {
                    video = Some(parse_video_track(&mut reader, &trak)?);
                }
                b"soun" if audio.is_none() => match parse_audio_track(&mut reader, &trak) {
                    Ok(info) => audio = Some(info),
                    Err(e) => tracing::warn!("Ignoring unreadable audio track: {e}"),
                },
                other => {
                    tracing::debug!("Skipping track with handler '{}'", fourcc_str(other));
                }
            }
        }

        pos += child.size;
    }

    let video = video.ok_or(DemuxError::NoVideoTrack)?;
    tracing::info!(
        codec = %video.decoder_config.codec,
        width = video.metadata.width(),
        height = video.metadata.height(),
        frames = video.metadata.total_frames(),
        fps = video.metadata.fps(),
        "Parsed moov"
    );
    Ok(MediaInfo { video, audio })
}

/// Positions of the boxes of one `trak` needed to describe it.
struct TrakBoxes {
    handler: FourCC,
    width: u32,
    height: u32,
    timescale: u32,
    duration: u64,
    stbl_start: u64,
    stbl_size: u64,
}

impl TrakBoxes {
    fn locate<R: Read + Seek>(reader: &mut R, trak_start: u64, trak_content: u64) -> Result<Self> {
        reader.seek(SeekFrom::Start(trak_start))?;
        require_child_box(reader, trak_content, b"tkhd", "tkhd")?;
        let (width, height) = parse_tkhd(reader)?;

        reader.seek(SeekFrom::Start(trak_start))?;
        let mdia = require_child_box(reader, trak_content, b"mdia", "mdia")?;
        let mdia_start = reader.stream_position()?;
        let mdia_content = mdia.content_size();

        require_child_box(reader, mdia_content, b"mdhd", "mdhd")?;
        let (timescale, duration) = parse_mdhd(reader)?;

        reader.seek(SeekFrom::Start(mdia_start))?;
        require_child_box(reader, mdia_content, b"hdlr", "hdlr")?;
        let handler = parse_hdlr(reader)?;

        reader.seek(SeekFrom::Start(mdia_start))?;
        let minf = require_child_box(reader, mdia_content, b"minf", "minf")?;
        let stbl = require_child_box(reader, minf.content_size(), b"stbl", "stbl")?;
        let stbl_start = reader.stream_position()?;

        Ok(Self {
            handler,
            width,
            height,
            timescale,
            duration,
            stbl_start,
            stbl_size: stbl.content_size(),
        })
    }

    /// Position the reader on stsd content and return its content size.
    fn seek_stsd<R: Read + Seek>(&self, reader: &mut R) -> Result<u64> {
        reader.seek(SeekFrom::Start(self.stbl_start))?;
        let stsd = require_child_box(reader, self.stbl_size, b"stsd", "stsd")?;
        Ok(stsd.content_size())
    }

    fn samples<R: Read + Seek>(&self, reader: &mut R) -> Result<Vec<Sample>> {
        reader.seek(SeekFrom::Start(self.stbl_start))?;
        sample_table::resolve_sample_table(reader, self.stbl_size, self.timescale)
    }
}

fn parse_video_track<R: Read + Seek>(reader: &mut R, trak: &TrakBoxes) -> Result<VideoTrack> {
    if trak.timescale == 0 {
        return Err(DemuxError::malformed("video track has a zero timescale"));
    }

    let stsd_size = trak.seek_stsd(reader)?;
    let entry = read_visual_sample_entry(reader, stsd_size)?;
    let codec = entry.codec_string()?;

    let samples = trak.samples(reader)?;

    // mdhd may leave the duration unset; the sample timing is authoritative then.
    let duration_ticks = if trak.duration > 0 {
        trak.duration
    } else {
        samples.iter().map(|s| s.duration as u64).sum()
    };
    if duration_ticks == 0 {
        return Err(DemuxError::malformed("video track has a zero duration"));
    }
    let duration = duration_ticks as f64 / trak.timescale as f64;
    let total_bytes: u64 = samples.iter().map(|s| s.size as u64).sum();
    let bitrate = (total_bytes as f64 * 8.0 / duration) as u64;

    let (width, height) = if trak.width > 0 && trak.height > 0 {
        (trak.width, trak.height)
    } else {
        (entry.width as u32, entry.height as u32)
    };

    let metadata = VideoMetadata::new(width, height, duration, samples.len() as u32, bitrate);
    let decoder_config = DecoderConfig {
        codec,
        description: Bytes::from(entry.config),
        coded_width: entry.width as u32,
        coded_height: entry.height as u32,
    };

    Ok(VideoTrack {
        metadata,
        decoder_config,
        samples,
    })
}

fn parse_audio_track<R: Read + Seek>(reader: &mut R, trak: &TrakBoxes) -> Result<AudioTrackInfo> {
    let stsd_size = trak.seek_stsd(reader)?;
    let entry = read_audio_sample_entry(reader, stsd_size)?;
    let samples = trak.samples(reader)?;

    let total_bytes: u64 = samples.iter().map(|s| s.size as u64).sum();
    let bitrate = if trak.duration > 0 && trak.timescale > 0 {
        (total_bytes as f64 * 8.0 * trak.timescale as f64 / trak.duration as f64) as u64
    } else {
        0
    };

    Ok(AudioTrackInfo {
        codec: entry.codec_string(),
        sample_rate: entry.sample_rate,
        channels: entry.channels,
        timescale: trak.timescale,
        duration: trak.duration,
        bitrate,
    })
}

/// Parse tkhd, return (width, height). Width/height are 16.16 fixed point.
fn parse_tkhd<R: Read + Seek>(reader: &mut R) -> Result<(u32, u32)> {
    let (version, _flags) = read_fullbox_header(reader)?;
    // creation + modification + track_id + reserved + duration
    let times = if version == 1 { 8 + 8 + 4 + 4 + 8 } else { 4 + 4 + 4 + 4 + 4 };
    // reserved(8) + layer(2) + alt_group(2) + volume(2) + reserved(2) + matrix(36)
    skip(reader, times + 52)?;
    let width = read_u32(reader)? >> 16;
    let height = read_u32(reader)? >> 16;
    Ok((width, height))
}

/// Parse mdhd, return (timescale, duration).
fn parse_mdhd<R: Read + Seek>(reader: &mut R) -> Result<(u32, u64)> {
    let (version, _flags) = read_fullbox_header(reader)?;
    if version == 1 {
        skip(reader, 16)?;
        let timescale = read_u32(reader)?;
        let duration = read_u64(reader)?;
        Ok((timescale, duration))
    } else {
        skip(reader, 8)?;
        let timescale = read_u32(reader)?;
        let duration = read_u32(reader)? as u64;
        Ok((timescale, duration))
    }
}

/// Parse hdlr, return handler_type.
fn parse_hdlr<R: Read>(reader: &mut R) -> Result<FourCC> {
    read_fullbox_header(reader)?;
    let _pre_defined = read_u32(reader)?;
    read_fourcc(reader)
}
