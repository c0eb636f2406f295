//! Playback state and the player-facing event taxonomy.
//!
//! [`StateManager`] holds the single authoritative [`PlaybackState`] of a
//! player and notifies an optional observer on every transition.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// PlaybackState
// ---------------------------------------------------------------------------

/// Lifecycle state of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Nothing loaded yet.
    #[default]
    Idle,
    /// Metadata is being fetched.
    Loading,
    /// Metadata loaded, ready to play.
    Loaded,
    /// Playing but starved of decoded frames.
    Buffering,
    Playing,
    Paused,
    Seeking,
    /// Every frame has been presented.
    Ended,
    Error,
    /// Torn down; no further use possible.
    Destroyed,
}

impl PlaybackState {
    /// Whether no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Destroyed)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Seeking => "seeking",
            Self::Ended => "ended",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PlayerEvent
// ---------------------------------------------------------------------------

/// Events a player emits to its listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerEvent {
    // -- Loading -------------------------------------------------------------
    /// The load process began.
    LoadStart,
    /// Duration, dimensions and tracks are known.
    LoadedMetadata,
    /// The first frame is available.
    LoadedData,
    /// Enough data is buffered to play.
    CanPlay,

    // -- Playback ------------------------------------------------------------
    Playing,
    Paused,
    /// Playback stalled waiting for data.
    Waiting,
    Seeked,

    // -- Completion ----------------------------------------------------------
    Ended,
    Error,

    // -- Lifecycle -----------------------------------------------------------
    Destroy,
}

impl fmt::Display for PlayerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoadStart => "loadstart",
            Self::LoadedMetadata => "loadedmetadata",
            Self::LoadedData => "loadeddata",
            Self::CanPlay => "canplay",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Waiting => "waiting",
            Self::Seeked => "seeked",
            Self::Ended => "ended",
            Self::Error => "error",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

type StateObserver = Box<dyn Fn(PlaybackState) + Send + Sync>;

/// Owner of the authoritative [`PlaybackState`].
pub struct StateManager {
    state: RwLock<PlaybackState>,
    observer: Option<StateObserver>,
}

impl StateManager {
    /// Create a manager in [`PlaybackState::Idle`] with no observer.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PlaybackState::Idle),
            observer: None,
        }
    }

    /// Create a manager that calls `observer` after every `set_state`.
    pub fn with_observer(observer: impl Fn(PlaybackState) + Send + Sync + 'static) -> Self {
        Self {
            state: RwLock::new(PlaybackState::Idle),
            observer: Some(Box::new(observer)),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.read()
    }

    /// Store `state` and notify the observer. Returns the previous state.
    pub fn set_state(&self, state: PlaybackState) -> PlaybackState {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!("Playback state {previous} -> {state}");
        }
        if let Some(observer) = &self.observer {
            observer(state);
        }
        previous
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_idle() {
        let manager = StateManager::default();
        assert_eq!(manager.state(), PlaybackState::Idle);
    }

    #[test]
    fn observer_sees_every_transition() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let manager = StateManager::with_observer(move |s| sink.lock().push(s));

        assert_eq!(manager.set_state(PlaybackState::Loading), PlaybackState::Idle);
        manager.set_state(PlaybackState::Loaded);
        manager.set_state(PlaybackState::Playing);

        assert_eq!(
            *seen.lock(),
            vec![
                PlaybackState::Loading,
                PlaybackState::Loaded,
                PlaybackState::Playing
            ]
        );
        assert_eq!(manager.state(), PlaybackState::Playing);
    }

    #[test]
    fn terminal_states() {
        assert!(PlaybackState::Error.is_terminal());
        assert!(PlaybackState::Destroyed.is_terminal());
        assert!(!PlaybackState::Ended.is_terminal());
    }

    #[test]
    fn display_matches_serde() {
        for state in [PlaybackState::Buffering, PlaybackState::Destroyed] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
        for event in [PlayerEvent::LoadedMetadata, PlayerEvent::CanPlay, PlayerEvent::LoadStart] {
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{event}\""));
        }
    }
}
