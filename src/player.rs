//! The application-facing player.
//!
//! A [`Player`] owns one pipeline worker per loaded source. Commands go to
//! the worker; the worker's events are applied on a forwarding task that
//! mirrors playback state, stores metadata and dispatches player events to
//! listeners. The worker stays authoritative for every state transition.

use std::sync::Arc;

use parking_lot::RwLock;
use rp_core::config::Config;
use rp_core::{ErrorReport, PlaybackState, PlayerEvent, SeekParam, StateManager, VideoMetadata};
use rp_pipeline::{
    spawn, Command, DecoderPort, Event, FrameSink, LoopbackDecoder, PipelineControl,
    PipelineSettings, TracingSink,
};
use rp_source::RangeSource;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::listeners::{EventManager, ListenerId};

/// Label passed with [`Command::Init`] when the source is supplied directly.
const PRESET_SOURCE: &str = "<preset source>";

/// Errors from [`Player`] control calls.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("invalid player configuration: {0}")]
    Config(#[from] rp_core::Error),

    #[error("no media loaded")]
    NotLoaded,

    #[error("media already loaded; destroy the player first")]
    AlreadyLoaded,

    #[error("player has been destroyed")]
    Destroyed,

    #[error("pipeline worker is no longer running")]
    WorkerGone,
}

pub type DecoderFactory = Box<dyn Fn() -> Box<dyn DecoderPort> + Send + Sync>;
pub type SinkFactory = Box<dyn Fn() -> Box<dyn FrameSink> + Send + Sync>;

/// State shared with the forwarding task.
struct Shared {
    state: StateManager,
    state_rx: watch::Receiver<PlaybackState>,
    listeners: EventManager,
    metadata: RwLock<Option<VideoMetadata>>,
    last_error: RwLock<Option<ErrorReport>>,
}

impl Shared {
    fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);
        Self {
            state: StateManager::with_observer(move |state| {
                state_tx.send_replace(state);
            }),
            state_rx,
            listeners: EventManager::new(),
            metadata: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    fn apply(&self, event: Event) {
        match event {
            Event::ChangePlayerState(state) => {
                self.state.set_state(state);
            }
            Event::MetadataLoaded(metadata) => {
                *self.metadata.write() = Some(metadata);
            }
            Event::EmitPlayerEvent { event, data } => {
                self.listeners.emit(event, &data.unwrap_or(Value::Null));
            }
            Event::Error(report) => {
                tracing::error!(code = report.kind.code(), "Playback error: {}", report.message);
                self.state.set_state(PlaybackState::Error);
                let data = serde_json::to_value(&report).unwrap_or(Value::Null);
                *self.last_error.write() = Some(report);
                self.listeners.emit(PlayerEvent::Error, &data);
            }
            Event::VideoFrameDecoded(frame) => {
                tracing::trace!(index = frame.index, ts = frame.timestamp_us, "Frame decoded");
            }
            other => tracing::debug!(?other, "Pipeline event"),
        }
    }
}

async fn forward(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        shared.apply(event);
    }
}

/// One loaded source.
struct Session {
    control: PipelineControl,
    forwarder: JoinHandle<()>,
}

/// Plays one progressive MP4 through a pipeline worker.
///
/// Loading spawns tokio tasks, so [`Player::load`] and
/// [`Player::load_source`] must be called from within a runtime.
pub struct Player {
    settings: PipelineSettings,
    autoplay: bool,
    shared: Arc<Shared>,
    decoder_factory: DecoderFactory,
    sink_factory: SinkFactory,
    volume: f64,
    muted: bool,
    destroyed: bool,
    session: Option<Session>,
}

impl Player {
    /// Create an idle player with the loopback decoder and a tracing sink.
    pub fn new(config: &Config) -> Result<Self, PlayerError> {
        for warning in config.validate() {
            tracing::warn!("Config: {warning}");
        }
        Ok(Self {
            settings: PipelineSettings::try_from(config)?,
            autoplay: config.player.autoplay,
            shared: Arc::new(Shared::new()),
            decoder_factory: Box::new(|| -> Box<dyn DecoderPort> {
                Box::new(LoopbackDecoder::new())
            }),
            sink_factory: Box::new(|| -> Box<dyn FrameSink> { Box::new(TracingSink::new()) }),
            volume: 1.0,
            muted: false,
            destroyed: false,
            session: None,
        })
    }

    /// Use `factory` to create the decoder of each loaded source.
    pub fn with_decoder(
        mut self,
        factory: impl Fn() -> Box<dyn DecoderPort> + Send + Sync + 'static,
    ) -> Self {
        self.decoder_factory = Box::new(factory);
        self
    }

    /// Use `factory` to create the frame sink of each loaded source.
    pub fn with_sink(
        mut self,
        factory: impl Fn() -> Box<dyn FrameSink> + Send + Sync + 'static,
    ) -> Self {
        self.sink_factory = Box::new(factory);
        self
    }

    // -- Loading ------------------------------------------------------------

    /// Load the MP4 at `url` over HTTP range requests.
    pub fn load(&mut self, url: impl Into<String>) -> Result<(), PlayerError> {
        self.open(None, url.into())
    }

    /// Load from an already constructed range source.
    pub fn load_source(&mut self, source: Arc<dyn RangeSource>) -> Result<(), PlayerError> {
        self.open(Some(source), PRESET_SOURCE.to_string())
    }

    fn open(
        &mut self,
        source: Option<Arc<dyn RangeSource>>,
        url: String,
    ) -> Result<(), PlayerError> {
        if self.destroyed {
            return Err(PlayerError::Destroyed);
        }
        if self.session.is_some() {
            return Err(PlayerError::AlreadyLoaded);
        }

        let handle = spawn(
            self.settings.clone(),
            source,
            (self.decoder_factory)(),
            (self.sink_factory)(),
        );
        let (control, events) = handle.split();
        let forwarder = tokio::spawn(forward(self.shared.clone(), events));

        tracing::info!(%url, autoplay = self.autoplay, "Loading");
        control.send(Command::Init { url });
        control.send(Command::Start);
        if self.autoplay {
            control.send(Command::Play);
        }
        self.session = Some(Session { control, forwarder });
        Ok(())
    }

    // -- Playback control ---------------------------------------------------

    pub fn play(&self) -> Result<(), PlayerError> {
        self.send(Command::Play)
    }

    pub fn pause(&self) -> Result<(), PlayerError> {
        self.send(Command::Pause)
    }

    /// Seek to the keyframe at or before `param`.
    pub fn seek(&self, param: SeekParam) -> Result<(), PlayerError> {
        self.send(Command::Seek(param))
    }

    /// Change the pacing rate. Non-positive or non-finite rates are ignored
    /// by the pipeline.
    pub fn set_playback_rate(&self, rate: f64) -> Result<(), PlayerError> {
        self.send(Command::SetPlaybackRate(rate))
    }

    fn send(&self, command: Command) -> Result<(), PlayerError> {
        if self.destroyed {
            return Err(PlayerError::Destroyed);
        }
        let session = self.session.as_ref().ok_or(PlayerError::NotLoaded)?;
        if session.control.send(command) {
            Ok(())
        } else {
            Err(PlayerError::WorkerGone)
        }
    }

    /// Store the volume clamped to `[0, 1]`. Non-finite values are ignored.
    pub fn set_volume(&mut self, volume: f64) {
        if !volume.is_finite() {
            tracing::warn!(volume, "Ignoring invalid volume");
            return;
        }
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Stop the pipeline, release every buffered frame, and wait for the
    /// worker to exit. Listeners observe `destroy` before they are removed.
    pub async fn destroy(&mut self) {
        if let Some(session) = self.session.take() {
            session.control.send(Command::Destroy);
            session.control.join().await;
            if let Err(e) = session.forwarder.await {
                tracing::error!("Event forwarder panicked: {e}");
            }
        }
        self.destroyed = true;
        self.shared.state.set_state(PlaybackState::Destroyed);
        self.shared.listeners.remove_all();
    }

    // -- Observation --------------------------------------------------------

    pub fn state(&self) -> PlaybackState {
        self.shared.state.state()
    }

    /// Receiver that sees every state the player moves through.
    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state_rx.clone()
    }

    pub fn metadata(&self) -> Option<VideoMetadata> {
        self.shared.metadata.read().clone()
    }

    pub fn last_error(&self) -> Option<ErrorReport> {
        self.shared.last_error.read().clone()
    }

    pub fn on(
        &self,
        event: PlayerEvent,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.listeners.on(event, handler)
    }

    pub fn off(&self, event: PlayerEvent, id: ListenerId) -> bool {
        self.shared.listeners.off(event, id)
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state())
            .field("volume", &self.volume)
            .field("muted", &self.muted)
            .field("loaded", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_is_clamped() {
        let mut player = Player::new(&Config::default()).unwrap();
        assert_eq!(player.volume(), 1.0);

        player.set_volume(1.7);
        assert_eq!(player.volume(), 1.0);
        player.set_volume(-0.5);
        assert_eq!(player.volume(), 0.0);
        player.set_volume(0.25);
        assert_eq!(player.volume(), 0.25);
        player.set_volume(f64::NAN);
        assert_eq!(player.volume(), 0.25);

        player.set_muted(true);
        assert!(player.muted());
    }

    #[test]
    fn control_before_load_is_rejected() {
        let player = Player::new(&Config::default()).unwrap();
        assert!(matches!(player.play(), Err(PlayerError::NotLoaded)));
        assert!(matches!(
            player.seek(SeekParam::time(1.0)),
            Err(PlayerError::NotLoaded)
        ));
        assert_eq!(player.state(), PlaybackState::Idle);
        assert!(player.metadata().is_none());
    }

    #[test]
    fn invalid_limits_fail_construction() {
        let mut config = Config::default();
        config.pipeline.max_buffer_count = 2;
        config.pipeline.max_video_frame_count = 10;
        assert!(matches!(
            Player::new(&config),
            Err(PlayerError::Config(_))
        ));
    }

    #[test]
    fn error_event_updates_state_and_notifies() {
        let shared = Shared::new();
        let seen = Arc::new(RwLock::new(None));
        let s = seen.clone();
        shared.listeners.on(PlayerEvent::Error, move |data| {
            *s.write() = data["kind"].as_str().map(str::to_string);
        });

        let report = rp_core::Error::video_decode("corrupt slice").report();
        shared.apply(Event::Error(report.clone()));

        assert_eq!(shared.state.state(), PlaybackState::Error);
        assert_eq!(*shared.state_rx.borrow(), PlaybackState::Error);
        assert_eq!(*shared.last_error.read(), Some(report));
        assert_eq!(seen.read().as_deref(), Some("VIDEO_DECODE_ERROR"));
    }

    #[tokio::test]
    async fn destroy_without_load_is_terminal() {
        let mut player = Player::new(&Config::default()).unwrap();
        player.destroy().await;
        assert_eq!(player.state(), PlaybackState::Destroyed);
        assert!(matches!(player.load("http://h/v.mp4"), Err(PlayerError::Destroyed)));
    }
}
