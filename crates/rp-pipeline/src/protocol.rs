//! Control commands into a pipeline worker and events coming back out.
//!
//! Both directions are closed sets encoded as `{"type": ..., "payload": ...}`
//! records with camelCase tags. Records with an unknown tag are ignored.

use rp_core::{ErrorReport, PlaybackState, PlayerEvent, SeekParam, VideoMetadata};
use serde::{Deserialize, Serialize};

/// Requests a controller sends to a pipeline worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Command {
    Init { url: String },
    Start,
    Play,
    Seek(SeekParam),
    Pause,
    SetPlaybackRate(f64),
    Destroy,
}

impl Command {
    /// Decode a command record; unknown or malformed records yield `None`.
    pub fn from_json(json: &str) -> Option<Self> {
        decode(json, "command")
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Timing of a frame that came out of the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    pub index: u32,
    pub timestamp_us: i64,
}

/// Notifications a pipeline worker sends to its controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    Initialized,
    Started,
    MetadataLoaded(VideoMetadata),
    Played,
    Seeked,
    Paused,
    VideoFrameDecoded(FrameInfo),
    EmitPlayerEvent {
        event: PlayerEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    ChangePlayerState(PlaybackState),
    Error(ErrorReport),
}

impl Event {
    /// Decode an event record; unknown or malformed records yield `None`.
    pub fn from_json(json: &str) -> Option<Self> {
        decode(json, "event")
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub(crate) fn player(event: PlayerEvent) -> Self {
        Self::EmitPlayerEvent { event, data: None }
    }

    pub(crate) fn player_with(event: PlayerEvent, data: impl Serialize) -> Self {
        Self::EmitPlayerEvent {
            event,
            data: serde_json::to_value(data).ok(),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(json: &str, what: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!("Ignoring {what} record: {e}");
            None
        }
    }
}
