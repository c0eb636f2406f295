//! Synthetic MP4 builders for tests.
//!
//! Produces complete progressive files (`ftyp` + `moov` + `mdat` in either
//! order) whose sample payloads are recognisable: every payload starts with
//! its sample index as a big-endian u32.

use rp_core::BoxLocation;

use crate::scanner::Layout;

// ---------------------------------------------------------------------------
// Low-level box writing helpers
// ---------------------------------------------------------------------------

/// Write a complete box: size (u32 BE) + type (4 ASCII bytes) + content.
pub fn write_box(box_type: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let size = (8 + content.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(content);
    out
}

/// Write a container box (size + type + children concatenated).
pub fn write_container_box(box_type: &[u8; 4], children: &[&[u8]]) -> Vec<u8> {
    write_box(box_type, &children.concat())
}

/// Version + flags word of a full box.
pub fn fullbox_header(version: u8, flags: u32) -> [u8; 4] {
    let val = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
    val.to_be_bytes()
}

// ---------------------------------------------------------------------------
// Canned configuration records
// ---------------------------------------------------------------------------

/// avcC for H.264 High profile, level 3.1, one SPS and one PPS.
pub const AVCC_HIGH_31: [u8; 17] = [
    0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00, 0x02,
    0x68, 0xEE,
];

/// hvcC for HEVC Main profile, main tier, level 3.1, no parameter arrays.
pub const HVCC_MAIN_31: [u8; 23] = [
    0x01, 0x01, 0x60, 0x00, 0x00, 0x00, 0x90, 0x00, 0x00, 0x00, 0x00, 0x00, 0x5D, 0xF0, 0x00,
    0xFC, 0xFD, 0xF8, 0xF8, 0x00, 0x00, 0x0F, 0x00,
];

/// vpcC (version 1) for VP9 profile 0, level 3.1, 8-bit.
pub const VPCC_PROFILE0: [u8; 12] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x1F, 0x80, 0x01, 0x01, 0x01, 0x00, 0x00,
];

/// av1C for AV1 main profile, level 4.0, 8-bit 4:2:0.
pub const AV1C_MAIN: [u8; 4] = [0x81, 0x08, 0x0C, 0x00];

/// esds content for AAC-LC.
pub const ESDS_AAC_LC: [u8; 31] = [
    0x00, 0x00, 0x00, 0x00, 0x03, 0x19, 0x00, 0x01, 0x00, 0x04, 0x11, 0x40, 0x15, 0x00, 0x00,
    0x00, 0x00, 0x01, 0xF4, 0x00, 0x00, 0x01, 0xF4, 0x00, 0x05, 0x02, 0x12, 0x10, 0x06, 0x01,
    0x02,
];

/// Video codec of a synthetic track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureCodec {
    Avc,
    Hevc,
    Vp9,
    Av1,
}

impl FixtureCodec {
    fn entry_and_config(&self) -> (&'static [u8; 4], &'static [u8; 4], &'static [u8]) {
        match self {
            Self::Avc => (b"avc1", b"avcC", &AVCC_HIGH_31),
            Self::Hevc => (b"hvc1", b"hvcC", &HVCC_MAIN_31),
            Self::Vp9 => (b"vp09", b"vpcC", &VPCC_PROFILE0),
            Self::Av1 => (b"av01", b"av1C", &AV1C_MAIN),
        }
    }

    /// The configuration record written for this codec.
    pub fn config(&self) -> &'static [u8] {
        self.entry_and_config().2
    }
}

// ---------------------------------------------------------------------------
// Individual boxes
// ---------------------------------------------------------------------------

pub fn write_ftyp() -> Vec<u8> {
    let mut content = Vec::with_capacity(20);
    content.extend_from_slice(b"isom");
    content.extend_from_slice(&0x200u32.to_be_bytes());
    content.extend_from_slice(b"isom");
    content.extend_from_slice(b"iso2");
    content.extend_from_slice(b"mp41");
    write_box(b"ftyp", &content)
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

pub fn write_mvhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(100);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&[0u8; 8]);
    content.extend_from_slice(&timescale.to_be_bytes());
    content.extend_from_slice(&duration.to_be_bytes());
    content.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    content.extend_from_slice(&0x0100u16.to_be_bytes());
    content.extend_from_slice(&[0u8; 10]);
    content.extend_from_slice(&identity_matrix());
    content.extend_from_slice(&[0u8; 24]);
    content.extend_from_slice(&3u32.to_be_bytes());
    write_box(b"mvhd", &content)
}

/// Track header, version 1. `width`/`height` are whole pixels.
pub fn write_tkhd(track_id: u32, duration: u64, width: u32, height: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(96);
    // flags = enabled | in_movie | in_preview
    content.extend_from_slice(&fullbox_header(1, 7));
    content.extend_from_slice(&[0u8; 16]);
    content.extend_from_slice(&track_id.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&duration.to_be_bytes());
    content.extend_from_slice(&[0u8; 8]);
    content.extend_from_slice(&[0u8; 4]);
    let volume: u16 = if width == 0 { 0x0100 } else { 0 };
    content.extend_from_slice(&volume.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    content.extend_from_slice(&identity_matrix());
    content.extend_from_slice(&(width << 16).to_be_bytes());
    content.extend_from_slice(&(height << 16).to_be_bytes());
    write_box(b"tkhd", &content)
}

/// Media header, version 0.
pub fn write_mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(24);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&[0u8; 8]);
    content.extend_from_slice(&timescale.to_be_bytes());
    content.extend_from_slice(&duration.to_be_bytes());
    // language "und"
    content.extend_from_slice(&0x55C4u16.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    write_box(b"mdhd", &content)
}

pub fn write_hdlr(handler_type: &[u8; 4], name: &str) -> Vec<u8> {
    let mut content = Vec::with_capacity(25 + name.len());
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(handler_type);
    content.extend_from_slice(&[0u8; 12]);
    content.extend_from_slice(name.as_bytes());
    content.push(0);
    write_box(b"hdlr", &content)
}

/// stsd holding one visual sample entry with its configuration box.
pub fn stsd_video(codec: FixtureCodec, width: u16, height: u16) -> Vec<u8> {
    let (entry, config_box, config) = codec.entry_and_config();

    let mut sample_entry = Vec::with_capacity(78 + config.len() + 8);
    sample_entry.extend_from_slice(&[0u8; 6]);
    sample_entry.extend_from_slice(&1u16.to_be_bytes());
    sample_entry.extend_from_slice(&[0u8; 16]);
    sample_entry.extend_from_slice(&width.to_be_bytes());
    sample_entry.extend_from_slice(&height.to_be_bytes());
    sample_entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    sample_entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    sample_entry.extend_from_slice(&0u32.to_be_bytes());
    sample_entry.extend_from_slice(&1u16.to_be_bytes());
    sample_entry.extend_from_slice(&[0u8; 32]);
    sample_entry.extend_from_slice(&0x0018u16.to_be_bytes());
    sample_entry.extend_from_slice(&(-1i16).to_be_bytes());
    sample_entry.extend_from_slice(&write_box(config_box, config));

    let mut content = Vec::new();
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&write_box(entry, &sample_entry));
    write_box(b"stsd", &content)
}

/// stsd holding one AAC `mp4a` sample entry.
pub fn stsd_audio(sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut sample_entry = Vec::with_capacity(28 + ESDS_AAC_LC.len() + 8);
    sample_entry.extend_from_slice(&[0u8; 6]);
    sample_entry.extend_from_slice(&1u16.to_be_bytes());
    sample_entry.extend_from_slice(&[0u8; 8]);
    sample_entry.extend_from_slice(&channels.to_be_bytes());
    sample_entry.extend_from_slice(&16u16.to_be_bytes());
    sample_entry.extend_from_slice(&[0u8; 4]);
    sample_entry.extend_from_slice(&(sample_rate << 16).to_be_bytes());
    sample_entry.extend_from_slice(&write_box(b"esds", &ESDS_AAC_LC));

    let mut content = Vec::new();
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&write_box(b"mp4a", &sample_entry));
    write_box(b"stsd", &content)
}

fn write_u32_table(box_type: &[u8; 4], rows: &[Vec<u32>]) -> Vec<u8> {
    let mut content = Vec::new();
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&(rows.len() as u32).to_be_bytes());
    for row in rows {
        for v in row {
            content.extend_from_slice(&v.to_be_bytes());
        }
    }
    write_box(box_type, &content)
}

fn write_stsz(sizes: &[u32]) -> Vec<u8> {
    let mut content = Vec::with_capacity(12 + sizes.len() * 4);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
    for s in sizes {
        content.extend_from_slice(&s.to_be_bytes());
    }
    write_box(b"stsz", &content)
}

/// Payload written for sample `index`: the index as big-endian u32, then
/// filler, truncated or padded to `size`.
pub fn sample_payload(index: u32, size: u32) -> Vec<u8> {
    let mut data = vec![0xA0 | (index % 16) as u8; size as usize];
    let tag = index.to_be_bytes();
    let n = tag.len().min(data.len());
    data[..n].copy_from_slice(&tag[..n]);
    data
}

// ---------------------------------------------------------------------------
// Whole files
// ---------------------------------------------------------------------------

/// Shape of the synthetic video track.
#[derive(Debug, Clone)]
pub struct VideoFixture {
    pub codec: FixtureCodec,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub sample_delta: u32,
    pub sample_sizes: Vec<u32>,
    /// Every n-th sample is a keyframe. 0 omits stss (all samples sync).
    pub keyframe_interval: u32,
    /// Per-sample ctts offsets. Empty omits ctts.
    pub composition_offsets: Vec<i32>,
    pub samples_per_chunk: u32,
}

impl VideoFixture {
    /// 30 fps AVC track of `frame_count` samples with a keyframe every 10.
    pub fn new(frame_count: u32) -> Self {
        Self {
            codec: FixtureCodec::Avc,
            width: 320,
            height: 240,
            timescale: 90_000,
            sample_delta: 3_000,
            sample_sizes: (0..frame_count).map(|i| 64 + (i % 7) * 16).collect(),
            keyframe_interval: 10,
            composition_offsets: Vec::new(),
            samples_per_chunk: 4,
        }
    }
}

impl Default for VideoFixture {
    fn default() -> Self {
        Self::new(30)
    }
}

/// Shape of the synthetic audio track.
#[derive(Debug, Clone)]
pub struct AudioFixture {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_count: u32,
    pub sample_size: u32,
}

impl Default for AudioFixture {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            sample_count: 8,
            sample_size: 32,
        }
    }
}

/// Description of a synthetic progressive MP4.
#[derive(Debug, Clone)]
pub struct Mp4Fixture {
    pub video: Option<VideoFixture>,
    pub audio: Option<AudioFixture>,
    pub layout: Layout,
    /// Write the mdat header with a 64-bit largesize.
    pub largesize_mdat: bool,
}

/// A built file and where its boxes ended up.
#[derive(Debug, Clone)]
pub struct BuiltMp4 {
    pub bytes: Vec<u8>,
    pub ftyp: BoxLocation,
    pub moov: BoxLocation,
    pub mdat: BoxLocation,
    /// (offset, size) of every video sample, by index.
    pub video_samples: Vec<(u64, u32)>,
}

impl BuiltMp4 {
    pub fn moov_bytes(&self) -> &[u8] {
        &self.bytes[self.moov.start() as usize..=self.moov.end() as usize]
    }

    /// Payload of video sample `index` as written into mdat.
    pub fn payload(&self, index: usize) -> &[u8] {
        let (offset, size) = self.video_samples[index];
        &self.bytes[offset as usize..offset as usize + size as usize]
    }
}

impl Mp4Fixture {
    pub fn new(layout: Layout) -> Self {
        Self {
            video: Some(VideoFixture::default()),
            audio: None,
            layout,
            largesize_mdat: false,
        }
    }

    pub fn with_video(mut self, video: VideoFixture) -> Self {
        self.video = Some(video);
        self
    }

    pub fn without_video(mut self) -> Self {
        self.video = None;
        self
    }

    pub fn with_audio(mut self, audio: AudioFixture) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_largesize_mdat(mut self) -> Self {
        self.largesize_mdat = true;
        self
    }

    pub fn build(&self) -> BuiltMp4 {
        let ftyp = write_ftyp();

        let mut payload = Vec::new();
        let mut video_rel = Vec::new();
        if let Some(video) = &self.video {
            for (i, &size) in video.sample_sizes.iter().enumerate() {
                video_rel.push(payload.len() as u64);
                payload.extend(sample_payload(i as u32, size));
            }
        }
        let audio_rel = payload.len() as u64;
        if let Some(audio) = &self.audio {
            for i in 0..audio.sample_count {
                payload.extend(sample_payload(i, audio.sample_size));
            }
        }

        let mdat_header_len: u64 = if self.largesize_mdat { 16 } else { 8 };
        // Chunk offsets are 32-bit regardless of base, so the moov length
        // does not depend on where the payload lands.
        let moov_len = self.write_moov(0, &video_rel, audio_rel).len() as u64;
        let ftyp_len = ftyp.len() as u64;
        let payload_base = match self.layout {
            Layout::MoovFirst => ftyp_len + moov_len + mdat_header_len,
            Layout::PayloadFirst => ftyp_len + mdat_header_len,
        };
        let moov = self.write_moov(payload_base, &video_rel, audio_rel);

        let mdat_size = mdat_header_len + payload.len() as u64;
        let mut mdat = Vec::with_capacity(mdat_size as usize);
        if self.largesize_mdat {
            mdat.extend_from_slice(&1u32.to_be_bytes());
            mdat.extend_from_slice(b"mdat");
            mdat.extend_from_slice(&mdat_size.to_be_bytes());
        } else {
            mdat.extend_from_slice(&(mdat_size as u32).to_be_bytes());
            mdat.extend_from_slice(b"mdat");
        }
        mdat.extend(payload);

        let mut bytes = Vec::with_capacity(ftyp.len() + moov.len() + mdat.len());
        bytes.extend_from_slice(&ftyp);
        let (moov_start, mdat_start) = match self.layout {
            Layout::MoovFirst => {
                bytes.extend_from_slice(&moov);
                bytes.extend_from_slice(&mdat);
                (ftyp_len, ftyp_len + moov.len() as u64)
            }
            Layout::PayloadFirst => {
                bytes.extend_from_slice(&mdat);
                bytes.extend_from_slice(&moov);
                (ftyp_len + mdat.len() as u64, ftyp_len)
            }
        };

        let video_samples = match &self.video {
            Some(video) => video_rel
                .iter()
                .zip(&video.sample_sizes)
                .map(|(&rel, &size)| (payload_base + rel, size))
                .collect(),
            None => Vec::new(),
        };

        BuiltMp4 {
            bytes,
            ftyp: span(0, ftyp_len),
            moov: span(moov_start, moov.len() as u64),
            mdat: span(mdat_start, mdat.len() as u64),
            video_samples,
        }
    }

    fn write_moov(&self, payload_base: u64, video_rel: &[u64], audio_rel: u64) -> Vec<u8> {
        let mut children: Vec<Vec<u8>> = vec![write_mvhd(1000, 0)];
        let mut track_id = 1;
        if let Some(video) = &self.video {
            children.push(video_trak(track_id, video, payload_base, video_rel));
            track_id += 1;
        }
        if let Some(audio) = &self.audio {
            children.push(audio_trak(track_id, audio, payload_base + audio_rel));
        }
        let refs: Vec<&[u8]> = children.iter().map(Vec::as_slice).collect();
        write_container_box(b"moov", &refs)
    }
}

fn span(start: u64, len: u64) -> BoxLocation {
    BoxLocation::new(start, start + len - 1).expect("fixture boxes are never empty")
}

fn video_trak(track_id: u32, video: &VideoFixture, base: u64, rel: &[u64]) -> Vec<u8> {
    let count = video.sample_sizes.len() as u32;
    let duration = count * video.sample_delta;

    let mut stbl_children = vec![
        stsd_video(video.codec, video.width as u16, video.height as u16),
        write_u32_table(b"stts", &[vec![count, video.sample_delta]]),
    ];
    if !video.composition_offsets.is_empty() {
        let rows: Vec<Vec<u32>> = video
            .composition_offsets
            .iter()
            .map(|&o| vec![1, o as u32])
            .collect();
        stbl_children.push(write_u32_table(b"ctts", &rows));
    }
    if video.keyframe_interval > 0 {
        let rows: Vec<Vec<u32>> = (0..count)
            .step_by(video.keyframe_interval as usize)
            .map(|i| vec![i + 1])
            .collect();
        stbl_children.push(write_u32_table(b"stss", &rows));
    }
    stbl_children.push(write_stsz(&video.sample_sizes));

    let spc = video.samples_per_chunk.max(1);
    let full_chunks = count / spc;
    let remainder = count % spc;
    let mut stsc = vec![vec![1, spc, 1]];
    if remainder != 0 && full_chunks > 0 {
        stsc.push(vec![full_chunks + 1, remainder, 1]);
    }
    stbl_children.push(write_u32_table(b"stsc", &stsc));
    let chunk_offsets: Vec<Vec<u32>> = rel
        .iter()
        .step_by(spc as usize)
        .map(|&r| vec![(base + r) as u32])
        .collect();
    stbl_children.push(write_u32_table(b"stco", &chunk_offsets));

    let stbl_refs: Vec<&[u8]> = stbl_children.iter().map(Vec::as_slice).collect();
    let stbl = write_container_box(b"stbl", &stbl_refs);
    let minf = write_container_box(b"minf", &[&stbl]);
    let mdia = write_container_box(
        b"mdia",
        &[
            &write_mdhd(video.timescale, duration),
            &write_hdlr(b"vide", "VideoHandler"),
            &minf,
        ],
    );
    write_container_box(
        b"trak",
        &[
            &write_tkhd(track_id, duration as u64, video.width, video.height),
            &mdia,
        ],
    )
}

fn audio_trak(track_id: u32, audio: &AudioFixture, chunk_offset: u64) -> Vec<u8> {
    let delta = 1024;
    let duration = audio.sample_count * delta;
    let sizes = vec![audio.sample_size; audio.sample_count as usize];
    let stbl = write_container_box(
        b"stbl",
        &[
            &stsd_audio(audio.sample_rate, audio.channels),
            &write_u32_table(b"stts", &[vec![audio.sample_count, delta]]),
            &write_stsz(&sizes),
            &write_u32_table(b"stsc", &[vec![1, audio.sample_count.max(1), 1]]),
            &write_u32_table(b"stco", &[vec![chunk_offset as u32]]),
        ],
    );
    let minf = write_container_box(b"minf", &[&stbl]);
    let mdia = write_container_box(
        b"mdia",
        &[
            &write_mdhd(audio.sample_rate, duration),
            &write_hdlr(b"soun", "SoundHandler"),
            &minf,
        ],
    );
    write_container_box(
        b"trak",
        &[&write_tkhd(track_id, duration as u64, 0, 0), &mdia],
    )
}
