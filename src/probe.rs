//! Media inspection without playback.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use rp_core::config::SourceConfig;
use rp_core::{AudioTrackInfo, MediaInfo, VideoMetadata};
use rp_pipeline::Demuxer;
use rp_source::{HttpRangeSource, MemorySource, RangeSource};
use serde::Serialize;

/// Where to read a resource from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Url(String),
    File(PathBuf),
}

impl Input {
    /// Open a range source for this input. Files are read into memory.
    pub async fn open(&self, config: &SourceConfig) -> rp_core::Result<Arc<dyn RangeSource>> {
        match self {
            Self::Url(url) => Ok(Arc::new(HttpRangeSource::new(url.clone(), config)?)),
            Self::File(path) => {
                let source = MemorySource::from_file(path).await.map_err(|e| {
                    rp_core::Error::source_load(format!("cannot read {}", path.display()), e)
                })?;
                Ok(Arc::new(source))
            }
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Decoder configuration as printed by `probe`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecReport {
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub description_len: usize,
}

/// Everything `probe` learns about a resource.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub metadata: VideoMetadata,
    pub decoder: CodecReport,
    pub samples: usize,
    pub keyframes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioTrackInfo>,
}

impl From<MediaInfo> for ProbeReport {
    fn from(info: MediaInfo) -> Self {
        let video = info.video;
        Self {
            decoder: CodecReport {
                codec: video.decoder_config.codec,
                coded_width: video.decoder_config.coded_width,
                coded_height: video.decoder_config.coded_height,
                description_len: video.decoder_config.description.len(),
            },
            keyframes: video.samples.iter().filter(|s| s.is_key_frame).count(),
            samples: video.samples.len(),
            metadata: video.metadata,
            audio: info.audio,
        }
    }
}

/// Load and summarize the structure of the MP4 behind `source`.
pub async fn probe_source(
    source: &dyn RangeSource,
    probe_window: u64,
) -> rp_core::Result<ProbeReport> {
    let info = Demuxer::load_metadata(source, probe_window).await?;
    Ok(info.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::ErrorKind;
    use rp_media::mp4::fixture::{AudioFixture, Mp4Fixture, VideoFixture};
    use rp_media::Layout;

    #[tokio::test]
    async fn report_counts_samples_and_keyframes() {
        let file = Mp4Fixture::new(Layout::PayloadFirst)
            .with_video(VideoFixture::new(25))
            .with_audio(AudioFixture::default())
            .build();
        let source = MemorySource::new(file.bytes);

        let report = probe_source(&source, 1024).await.unwrap();
        assert_eq!(report.samples, 25);
        assert_eq!(report.keyframes, 3);
        assert!(report.decoder.codec.starts_with("avc1."));
        assert!(report.audio.is_some());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metadata"]["totalFrames"], 25);
        assert!(json["decoder"]["descriptionLen"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn missing_file_is_source_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = Input::File(dir.path().join("absent.mp4"));
        let err = input.open(&SourceConfig::default()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SourceLoadFailure);
    }

    #[tokio::test]
    async fn file_input_reads_whole_file() {
        let file = Mp4Fixture::new(Layout::MoovFirst).build();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, &file.bytes).unwrap();

        let source = Input::File(path).open(&SourceConfig::default()).await.unwrap();
        let report = probe_source(source.as_ref(), 4096).await.unwrap();
        assert_eq!(report.metadata.total_frames(), 30);
    }
}
