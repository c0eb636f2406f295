//! Media data model shared by the demuxer, the scheduler, and the player.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Resource geometry
// ---------------------------------------------------------------------------

/// Total byte length of the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceSize(pub u64);

impl ResourceSize {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Offset of the last byte of the resource.
    pub fn last_byte(self) -> Option<u64> {
        self.0.checked_sub(1)
    }
}

impl fmt::Display for ResourceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Inclusive byte range `[start, end]` of a region inside the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoxLocation {
    start: u64,
    end: u64,
}

impl BoxLocation {
    /// Create a location, rejecting `end < start`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(Error::Demux {
                message: format!("invalid box range {start}-{end}"),
                source: None,
            });
        }
        Ok(Self { start, end })
    }

    /// Location of a box given its first byte and declared size.
    pub fn from_size(start: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::Demux {
                message: format!("zero-sized box at offset {start}"),
                source: None,
            });
        }
        let end = start.checked_add(size - 1).ok_or_else(|| Error::Demux {
            message: format!("box at offset {start} with size {size} overflows u64"),
            source: None,
        })?;
        Self::new(start, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered (always at least 1).
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether the location lies entirely within a resource of `size` bytes.
    pub fn fits_within(&self, size: ResourceSize) -> bool {
        self.end < size.get()
    }
}

impl fmt::Display for BoxLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Track metadata
// ---------------------------------------------------------------------------

/// Immutable description of the video track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    width: u32,
    height: u32,
    /// Seconds.
    duration: f64,
    total_frames: u32,
    fps: f64,
    /// Bits per second.
    bitrate: u64,
}

impl VideoMetadata {
    /// Build metadata from track-level values. `fps` is derived as
    /// `total_frames / duration`.
    pub fn new(width: u32, height: u32, duration: f64, total_frames: u32, bitrate: u64) -> Self {
        let fps = if duration > 0.0 {
            total_frames as f64 / duration
        } else {
            0.0
        };
        Self {
            width,
            height,
            duration,
            total_frames,
            fps,
            bitrate,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }
}

/// What a decoder needs before it can accept encoded units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// RFC 6381 codec string, e.g. `avc1.64001f`.
    pub codec: String,
    /// Codec-specific configuration record (avcC/hvcC/... payload).
    pub description: Bytes,
    pub coded_width: u32,
    pub coded_height: u32,
}

/// Reserved description of the first audio track. Never decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub timescale: u32,
    pub duration: u64,
    pub bitrate: u64,
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// One encoded sample of a track and where its bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// 0-based position in decode order.
    pub index: u32,
    pub is_key_frame: bool,
    /// Composition timestamp in `timescale` ticks.
    pub cts: u64,
    /// Decode timestamp in `timescale` ticks.
    pub dts: u64,
    pub duration: u32,
    pub timescale: u32,
    /// Absolute byte offset inside the resource.
    pub offset: u64,
    pub size: u32,
}

impl Sample {
    /// Presentation timestamp in microseconds.
    pub fn timestamp_us(&self) -> i64 {
        ticks_to_us(self.cts, self.timescale)
    }

    pub fn duration_us(&self) -> i64 {
        ticks_to_us(self.duration as u64, self.timescale)
    }

    /// Payload location inside the resource.
    pub fn byte_range(&self) -> Result<BoxLocation> {
        BoxLocation::from_size(self.offset, self.size as u64)
    }
}

fn ticks_to_us(ticks: u64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    ((ticks as u128 * 1_000_000) / timescale as u128) as i64
}

/// Whether a unit can be decoded on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Key,
    Delta,
}

/// Payload bytes of one sample, ready for the decoder.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub sample: Sample,
    pub data: Bytes,
}

impl EncodedUnit {
    pub fn new(sample: Sample, data: Bytes) -> Self {
        Self { sample, data }
    }

    pub fn chunk_type(&self) -> ChunkType {
        if self.sample.is_key_frame {
            ChunkType::Key
        } else {
            ChunkType::Delta
        }
    }

    pub fn timestamp_us(&self) -> i64 {
        self.sample.timestamp_us()
    }

    pub fn duration_us(&self) -> i64 {
        self.sample.duration_us()
    }
}

// ---------------------------------------------------------------------------
// Decoded frames
// ---------------------------------------------------------------------------

/// A finite external resource backing a decoded frame (GPU surface, pooled
/// buffer, ...).
pub trait FrameResource: Send {
    /// Give the resource back. Called exactly once per frame.
    fn release(&mut self);
}

/// Owned handle to a decoded picture.
///
/// The backing resource is released exactly once: either by
/// [`DecodedFrame::release`] or when the handle is dropped.
pub struct DecodedFrame {
    sample_index: u32,
    timestamp_us: i64,
    duration_us: i64,
    resource: Option<Box<dyn FrameResource>>,
}

impl DecodedFrame {
    pub fn new(
        sample_index: u32,
        timestamp_us: i64,
        duration_us: i64,
        resource: Box<dyn FrameResource>,
    ) -> Self {
        Self {
            sample_index,
            timestamp_us,
            duration_us,
            resource: Some(resource),
        }
    }

    /// Index of the sample this frame was decoded from.
    pub fn sample_index(&self) -> u32 {
        self.sample_index
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn duration_us(&self) -> i64 {
        self.duration_us
    }

    /// Release the backing resource now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mut resource) = self.resource.take() {
            resource.release();
        }
    }
}

impl Drop for DecodedFrame {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("sample_index", &self.sample_index)
            .field("timestamp_us", &self.timestamp_us)
            .field("duration_us", &self.duration_us)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Demux output
// ---------------------------------------------------------------------------

/// Everything the pipeline needs from the video track.
#[derive(Debug, Clone)]
pub struct VideoTrack {
    pub metadata: VideoMetadata,
    pub decoder_config: DecoderConfig,
    /// Ordered by `Sample::index`.
    pub samples: Vec<Sample>,
}

/// Demuxed structure of a resource.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub video: VideoTrack,
    pub audio: Option<AudioTrackInfo>,
}

// ---------------------------------------------------------------------------
// Seeking
// ---------------------------------------------------------------------------

/// How a seek target is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeekKind {
    /// Seconds from the start of the presentation.
    Time,
    FrameIndex,
}

/// Target of a seek request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeekParam {
    #[serde(rename = "type")]
    pub kind: SeekKind,
    pub value: f64,
}

impl SeekParam {
    pub fn time(seconds: f64) -> Self {
        Self {
            kind: SeekKind::Time,
            value: seconds,
        }
    }

    pub fn frame_index(index: u32) -> Self {
        Self {
            kind: SeekKind::FrameIndex,
            value: index as f64,
        }
    }
}
