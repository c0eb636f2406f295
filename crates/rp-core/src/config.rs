//! Player configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON. Every section
//! defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub player: PlayerConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| Error::Unknown {
            message: format!("config parse error: {e}"),
            source: Some(Box::new(e)),
        })
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None`, the file does not exist, or it cannot be parsed.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let p = &self.pipeline;

        if p.max_video_frame_count == 0 {
            warnings.push("pipeline.max_video_frame_count is 0; no frame can ever be buffered".into());
        }
        if p.max_buffer_count <= p.max_video_frame_count {
            warnings.push(format!(
                "pipeline.max_buffer_count ({}) must exceed max_video_frame_count ({}) to leave room for reference frames",
                p.max_buffer_count, p.max_video_frame_count
            ));
        }
        if p.sample_batch_size == 0 {
            warnings.push("pipeline.sample_batch_size is 0; the backlog can never be refilled".into());
        }
        if p.probe_window < MIN_PROBE_WINDOW {
            warnings.push(format!(
                "pipeline.probe_window ({}) is smaller than {MIN_PROBE_WINDOW} bytes",
                p.probe_window
            ));
        }

        if self.source.request_timeout_secs == 0 {
            warnings.push("source.request_timeout_secs is 0; requests will never time out".into());
        }

        let rate = self.player.playback_rate;
        if !(rate.is_finite() && rate > 0.0) {
            warnings.push(format!("player.playback_rate {rate} is not a positive number"));
        }

        warnings
    }
}

/// Smallest probe window that can hold a file-type box header and a tag.
pub const MIN_PROBE_WINDOW: u64 = 16;

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Scheduler budgets and demux window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cap on units in the decoder plus frames waiting for presentation.
    pub max_buffer_count: usize,
    /// Cap on decoded frames waiting for presentation.
    pub max_video_frame_count: usize,
    /// Samples pulled from the index per backlog refill.
    pub sample_batch_size: usize,
    /// Bytes fetched from the head of the resource to locate the moov box.
    pub probe_window: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_buffer_count: 20,
            max_video_frame_count: 10,
            sample_batch_size: 16,
            probe_window: 1024,
        }
    }
}

/// Transport settings for range requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    pub user_agent: Option<String>,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            user_agent: None,
        }
    }
}

/// Player facade behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Start playing as soon as metadata is loaded.
    pub autoplay: bool,
    pub playback_rate: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            autoplay: false,
            playback_rate: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Checked limits
// ---------------------------------------------------------------------------

/// Scheduler budgets that have passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLimits {
    max_buffer_count: usize,
    max_video_frame_count: usize,
    sample_batch_size: usize,
}

impl PipelineLimits {
    /// Requires `max_buffer_count > max_video_frame_count > 0` and a non-zero
    /// batch size.
    pub fn new(
        max_buffer_count: usize,
        max_video_frame_count: usize,
        sample_batch_size: usize,
    ) -> Result<Self> {
        if max_video_frame_count == 0 || max_buffer_count <= max_video_frame_count {
            return Err(Error::unknown(format!(
                "invalid buffer limits: max_buffer_count={max_buffer_count}, max_video_frame_count={max_video_frame_count}"
            )));
        }
        if sample_batch_size == 0 {
            return Err(Error::unknown("sample_batch_size must be at least 1"));
        }
        Ok(Self {
            max_buffer_count,
            max_video_frame_count,
            sample_batch_size,
        })
    }

    pub fn max_buffer_count(&self) -> usize {
        self.max_buffer_count
    }

    pub fn max_video_frame_count(&self) -> usize {
        self.max_video_frame_count
    }

    pub fn sample_batch_size(&self) -> usize {
        self.sample_batch_size
    }
}

impl TryFrom<&PipelineConfig> for PipelineLimits {
    type Error = Error;

    fn try_from(cfg: &PipelineConfig) -> Result<Self> {
        Self::new(
            cfg.max_buffer_count,
            cfg.max_video_frame_count,
            cfg.sample_batch_size,
        )
    }
}

impl Default for PipelineLimits {
    fn default() -> Self {
        let cfg = PipelineConfig::default();
        Self {
            max_buffer_count: cfg.max_buffer_count,
            max_video_frame_count: cfg.max_video_frame_count,
            sample_batch_size: cfg.sample_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.pipeline.max_buffer_count, 20);
        assert_eq!(cfg.pipeline.max_video_frame_count, 10);
        assert_eq!(cfg.pipeline.probe_window, 1024);
        assert_eq!(cfg.source.request_timeout_secs, 30);
        assert!(!cfg.player.autoplay);
        assert_eq!(cfg.player.playback_rate, 1.0);
    }

    #[test]
    fn default_config_no_warnings() {
        let warnings = Config::default().validate();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn buffer_not_larger_than_frames_warns() {
        let mut cfg = Config::default();
        cfg.pipeline.max_buffer_count = 10;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("max_buffer_count")));
    }

    #[test]
    fn bad_playback_rate_warns() {
        let mut cfg = Config::default();
        cfg.player.playback_rate = 0.0;
        assert!(cfg.validate().iter().any(|w| w.contains("playback_rate")));
    }

    #[test]
    fn parse_partial_json() {
        let cfg = Config::from_json(r#"{"pipeline": {"max_buffer_count": 32}}"#).unwrap();
        assert_eq!(cfg.pipeline.max_buffer_count, 32);
        assert_eq!(cfg.pipeline.max_video_frame_count, 10);
    }

    #[test]
    fn parse_empty_json_uses_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.pipeline.sample_batch_size, 16);
    }

    #[test]
    fn parse_invalid_json_fails() {
        assert!(Config::from_json("{ not json").is_err());
    }

    #[test]
    fn load_or_default_with_none() {
        let cfg = Config::load_or_default(None);
        assert_eq!(cfg.pipeline.max_buffer_count, 20);
    }

    #[test]
    fn load_or_default_with_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/rangeplay.json")));
        assert_eq!(cfg.pipeline.max_buffer_count, 20);
    }

    #[test]
    fn load_or_default_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"player": {{"autoplay": true}}}}"#).unwrap();
        let cfg = Config::load_or_default(Some(file.path()));
        assert!(cfg.player.autoplay);
    }

    #[test]
    fn limits_require_headroom() {
        assert!(PipelineLimits::new(10, 10, 4).is_err());
        assert!(PipelineLimits::new(20, 0, 4).is_err());
        assert!(PipelineLimits::new(20, 10, 0).is_err());
        let limits = PipelineLimits::try_from(&PipelineConfig::default()).unwrap();
        assert_eq!(limits, PipelineLimits::default());
    }
}
