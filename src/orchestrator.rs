//! Source orchestrator: owns the source registry, enforces the
//! one-primary invariant, dispatches control commands and assembles the
//! playback/now-playing DTOs the control surface returns.
//!
//! Ownership: the orchestrator owns sources and the event coordinator
//! (which owns the ducking engine); sources only ever see the engine
//! through the mixer's shared state, never the other way around, so
//! disposal is cycle-free.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};

use crate::devices::DeviceManager;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::mixer::ducking::{DuckingState, EventCoordinator};
use crate::mixer::{Mixer, MixerNotice};
use crate::source::event::{ClipProducer, EventKind, EventSource};
use crate::source::file::FilePlayer;
use crate::source::line_in::{LineInKind, UsbLineIn};
use crate::source::queue::{QueueItem, RepeatMode};
use crate::source::radio::{SdrFrontend, SdrRadio};
use crate::source::streaming::{StreamingBackend, StreamingCatalog, StreamingSource};
use crate::source::{
    AudioSource, Capabilities, DEFAULT_ALBUM, DEFAULT_ALBUM_ART, DEFAULT_ARTIST, DEFAULT_TITLE,
    MetadataKey, MetadataValue, SourceState, TrackMetadata,
};

/// Combined current-primary snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaybackStateDto {
    pub is_playing: bool,
    pub is_paused: bool,
    pub volume: f32,
    pub is_muted: bool,
    pub balance: f32,
    pub position_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub active_source: Option<ActiveSourceDto>,
    pub ducking_state: Option<DuckingState>,
    pub can_play: bool,
    pub can_pause: bool,
    pub can_stop: bool,
    pub can_seek: bool,
    pub can_next: bool,
    pub can_previous: bool,
    pub can_shuffle: bool,
    pub can_repeat: bool,
    pub can_queue: bool,
    pub is_shuffle_enabled: bool,
    pub repeat_mode: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveSourceDto {
    pub id: String,
    pub name: String,
    pub source_type: String,
    pub state: SourceState,
    pub volume: f32,
}

/// Now-playing snapshot. Never carries null strings: defaults are
/// substituted here, at the serialization boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NowPlayingDto {
    pub source_type: String,
    pub source_name: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_art_url: String,
    pub position_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub metadata_source: Option<String>,
}

/// Playback update actions accepted by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
pub enum PlaybackAction {
    #[default]
    None,
    Play,
    Pause,
    Stop,
    Seek,
}

/// Playback update request.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PlaybackUpdate {
    #[serde(default)]
    pub action: PlaybackAction,
    pub volume: Option<f32>,
    pub balance: Option<f32>,
    pub is_muted: Option<bool>,
    pub seek_position_ms: Option<u64>,
}

/// A track identification event from the external fingerprinting service.
#[derive(Debug, Clone)]
pub struct TrackIdentified {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub album_art_url: Option<String>,
    pub confidence: f64,
    pub identified_at: DateTime<Utc>,
}

/// Everything needed to build source variants on demand.
pub struct SourceFactory {
    pub bus: Arc<EventBus>,
    pub devices: Arc<DeviceManager>,
    pub library_root: std::path::PathBuf,
    pub streaming_backend: Option<Arc<dyn StreamingBackend>>,
    pub streaming_catalog: Option<Arc<dyn StreamingCatalog>>,
    pub sdr_frontend: Box<dyn Fn() -> Box<dyn SdrFrontend> + Send + Sync>,
    /// Restored per-source preferences, consumed at first build
    pub restored_prefs: Mutex<HashMap<String, crate::db::SourcePrefs>>,
    pub prefs_tx: Option<crossbeam_channel::Sender<crate::db::SourcePrefs>>,
}

/// A selectable source type, for the "available sources" listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AvailableSource {
    pub source_type: String,
    pub display_name: String,
    pub requires_config: Vec<String>,
}

pub fn available_sources() -> Vec<AvailableSource> {
    vec![
        AvailableSource {
            source_type: "file".to_string(),
            display_name: "File Player".to_string(),
            requires_config: vec![],
        },
        AvailableSource {
            source_type: "radio".to_string(),
            display_name: "SDR Radio".to_string(),
            requires_config: vec![],
        },
        AvailableSource {
            source_type: "turntable".to_string(),
            display_name: "Turntable".to_string(),
            requires_config: vec!["usb_port".to_string()],
        },
        AvailableSource {
            source_type: "usb".to_string(),
            display_name: "USB Line In".to_string(),
            requires_config: vec!["usb_port".to_string()],
        },
        AvailableSource {
            source_type: "streaming".to_string(),
            display_name: "Streaming".to_string(),
            requires_config: vec![],
        },
    ]
}

impl SourceFactory {
    fn build(&self, source_type: &str, config: &HashMap<String, String>) -> Result<Arc<dyn AudioSource>> {
        let id = format!("{source_type}-primary");
        match source_type {
            "file" => {
                let restored = self.restored_prefs.lock().remove(&id);
                let player = FilePlayer::new(
                    id,
                    self.library_root.clone(),
                    Arc::clone(&self.bus),
                    restored,
                    self.prefs_tx.clone(),
                );
                Ok(Arc::new(player))
            }
            "radio" => Ok(Arc::new(SdrRadio::new(
                id,
                (self.sdr_frontend)(),
                Arc::clone(&self.bus),
            ))),
            "turntable" | "usb" => {
                let port = config
                    .get("usb_port")
                    .ok_or_else(|| Error::invalid_argument("usb_port is required"))?;
                let flavor = if source_type == "turntable" {
                    LineInKind::Turntable
                } else {
                    LineInKind::Generic
                };
                Ok(Arc::new(UsbLineIn::new(
                    id,
                    flavor,
                    port.clone(),
                    Arc::clone(&self.devices),
                    Arc::clone(&self.bus),
                )))
            }
            "streaming" => {
                let backend = self
                    .streaming_backend
                    .clone()
                    .ok_or_else(|| Error::invalid_argument("streaming is not configured"))?;
                Ok(Arc::new(StreamingSource::new(id, backend, Arc::clone(&self.bus))))
            }
            other => Err(Error::invalid_argument(format!("unknown source type: {other}"))),
        }
    }
}

pub struct Orchestrator {
    bus: Arc<EventBus>,
    mixer: Arc<Mixer>,
    coordinator: Arc<EventCoordinator>,
    factory: SourceFactory,
    sources: RwLock<HashMap<String, Arc<dyn AudioSource>>>,
    primary_id: RwLock<Option<String>>,
    active_events: Arc<Mutex<HashMap<String, Arc<EventSource>>>>,
    notice_thread: Mutex<Option<JoinHandle<()>>>,
    event_counter: std::sync::atomic::AtomicU64,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        mixer: Arc<Mixer>,
        coordinator: Arc<EventCoordinator>,
        factory: SourceFactory,
        notices: Receiver<MixerNotice>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            bus,
            mixer,
            coordinator,
            factory,
            sources: RwLock::new(HashMap::new()),
            primary_id: RwLock::new(None),
            active_events: Arc::new(Mutex::new(HashMap::new())),
            notice_thread: Mutex::new(None),
            event_counter: std::sync::atomic::AtomicU64::new(1),
        });

        // Drain mixer notices: an exhausted event feed means the clip
        // finished and the event deregisters itself.
        let weak = Arc::downgrade(&orchestrator);
        let thread = std::thread::Builder::new()
            .name("orchestrator-notices".to_string())
            .spawn(move || {
                while let Ok(notice) = notices.recv() {
                    let Some(orchestrator) = weak.upgrade() else {
                        return;
                    };
                    match notice {
                        MixerNotice::FeedExhausted(source_id) => {
                            orchestrator.on_feed_exhausted(&source_id);
                        }
                    }
                }
            })
            .expect("failed to spawn notice thread");
        *orchestrator.notice_thread.lock() = Some(thread);

        orchestrator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    pub fn ducking_state(&self) -> DuckingState {
        self.coordinator.engine().state()
    }

    fn on_feed_exhausted(&self, source_id: &str) {
        let event = self.active_events.lock().remove(source_id);
        if let Some(event) = event {
            tracing::debug!(event = source_id, "event clip finished");
            if matches!(event.state(), SourceState::Playing | SourceState::Paused) {
                let _ = event.stop();
            }
            self.coordinator.event_finished(source_id);
            let _ = event.dispose();
        } else {
            tracing::debug!(source = source_id, "primary feed exhausted");
        }
    }

    // ---- primary source management ----

    /// Select (creating if needed) the primary source of `source_type`.
    /// The previous primary is stopped first, keeping the one-primary
    /// invariant.
    pub fn select_source(
        &self,
        source_type: &str,
        config: &HashMap<String, String>,
    ) -> Result<Arc<dyn AudioSource>> {
        let id = format!("{source_type}-primary");

        // Stop whatever is currently playing before switching
        if let Some(previous) = self.primary() {
            if previous.id() != id
                && matches!(previous.state(), SourceState::Playing | SourceState::Paused)
            {
                previous.stop().map_err(|e| e.context("stopping previous primary"))?;
            }
        }

        if let Some(existing) = self.sources.read().get(&id) {
            *self.primary_id.write() = Some(id);
            return Ok(Arc::clone(existing));
        }

        let source = self.factory.build(source_type, config)?;
        source.initialize()?;
        let feed = source.take_mixer_feed()?;
        self.mixer.add_feed(feed);

        self.sources.write().insert(id.clone(), Arc::clone(&source));
        *self.primary_id.write() = Some(id);
        tracing::info!(source = source.id(), "primary source selected");
        Ok(source)
    }

    /// The current primary source, if any.
    pub fn primary(&self) -> Option<Arc<dyn AudioSource>> {
        let id = self.primary_id.read().clone()?;
        self.sources.read().get(&id).cloned()
    }

    /// The primary source or `NotFound`.
    pub fn require_primary(&self) -> Result<Arc<dyn AudioSource>> {
        self.primary().ok_or_else(|| Error::not_found("no active primary source"))
    }

    /// All registered sources.
    pub fn active_sources(&self) -> Vec<Arc<dyn AudioSource>> {
        self.sources.read().values().cloned().collect()
    }

    pub fn source_by_id(&self, id: &str) -> Option<Arc<dyn AudioSource>> {
        self.sources.read().get(id).cloned()
    }

    /// Dispose a source and drop it from the registry and mix graph.
    pub fn dispose_source(&self, id: &str) -> Result<()> {
        let source = self
            .sources
            .write()
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("source {id}")))?;
        self.mixer.remove_feed(id);
        source.dispose()?;
        let mut primary = self.primary_id.write();
        if primary.as_deref() == Some(id) {
            *primary = None;
        }
        Ok(())
    }

    /// Stop and dispose everything (shutdown path). USB reservations are
    /// released by each source's dispose.
    pub fn dispose_all(&self) {
        for event in self.active_events.lock().drain() {
            let _ = event.1.dispose();
        }
        let ids: Vec<String> = self.sources.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.dispose_source(&id) {
                tracing::warn!(source = %id, "dispose failed during shutdown: {e}");
            }
        }
    }

    // ---- transport / playback state ----

    /// Apply a playback update request and return the new snapshot.
    pub fn update_playback(&self, update: &PlaybackUpdate) -> Result<PlaybackStateDto> {
        if let Some(volume) = update.volume {
            if !(0.0..=1.0).contains(&volume) {
                return Err(Error::invalid_argument("volume must be in [0,1]"));
            }
            self.mixer.shared().master_volume.set(volume);
        }
        if let Some(balance) = update.balance {
            if !(-1.0..=1.0).contains(&balance) {
                return Err(Error::invalid_argument("balance must be in [-1,1]"));
            }
            self.mixer.shared().master_balance.set(balance);
        }
        if let Some(muted) = update.is_muted {
            self.mixer.shared().set_muted(muted);
        }

        match update.action {
            PlaybackAction::None => {}
            PlaybackAction::Play => {
                let primary = self.require_primary()?;
                match primary.state() {
                    SourceState::Paused => primary.resume()?,
                    SourceState::Playing => {}
                    _ => primary.play()?,
                }
            }
            PlaybackAction::Pause => self.require_primary()?.pause()?,
            PlaybackAction::Stop => self.require_primary()?.stop()?,
            PlaybackAction::Seek => {
                let position = update
                    .seek_position_ms
                    .ok_or_else(|| Error::invalid_argument("seek requires seek_position_ms"))?;
                self.require_primary()?.seek(Duration::from_millis(position))?;
            }
        }

        Ok(self.playback_state())
    }

    /// Assemble the combined playback snapshot.
    pub fn playback_state(&self) -> PlaybackStateDto {
        let shared = self.mixer.shared();
        let primary = self.primary();

        let (state, caps, shuffle, repeat) = match &primary {
            Some(source) => (
                source.state(),
                source.capabilities(),
                source.shuffle_enabled(),
                Some(source.repeat_mode()),
            ),
            None => (SourceState::Created, Capabilities::empty(), false, None),
        };
        let is_playing = state == SourceState::Playing;
        let is_paused = state == SourceState::Paused;
        let startable = matches!(
            state,
            SourceState::Ready | SourceState::Stopped | SourceState::Paused
        );

        PlaybackStateDto {
            is_playing,
            is_paused,
            volume: shared.master_volume.get(),
            is_muted: shared.muted(),
            balance: shared.master_balance.get(),
            position_ms: primary
                .as_ref()
                .and_then(|s| s.position())
                .map(|d| d.as_millis() as u64),
            duration_ms: primary
                .as_ref()
                .and_then(|s| s.duration())
                .map(|d| d.as_millis() as u64),
            active_source: primary.as_ref().map(|source| ActiveSourceDto {
                id: source.id().to_string(),
                name: source.name().to_string(),
                source_type: source.kind().as_str().to_string(),
                state,
                volume: source.volume(),
            }),
            ducking_state: Some(self.ducking_state()),
            can_play: primary.is_some() && startable,
            can_pause: is_playing,
            can_stop: is_playing || is_paused,
            can_seek: caps.contains(Capabilities::SEEKABLE) && (is_playing || is_paused),
            can_next: caps.contains(Capabilities::NEXT),
            can_previous: caps.contains(Capabilities::PREVIOUS),
            can_shuffle: caps.contains(Capabilities::SHUFFLE),
            can_repeat: caps.contains(Capabilities::REPEAT),
            can_queue: caps.contains(Capabilities::QUEUE),
            is_shuffle_enabled: shuffle,
            repeat_mode: repeat.map(|r| r.as_str().to_string()),
        }
    }

    /// Assemble the now-playing snapshot; defaults are substituted here
    /// so the DTO never carries null strings.
    pub fn now_playing(&self) -> NowPlayingDto {
        match self.primary() {
            Some(source) => {
                let meta = source.metadata();
                NowPlayingDto {
                    source_type: source.kind().as_str().to_string(),
                    source_name: source.name().to_string(),
                    title: meta.display_title().to_string(),
                    artist: meta.display_artist().to_string(),
                    album: meta.display_album().to_string(),
                    album_art_url: meta.display_album_art().to_string(),
                    position_ms: source.position().map(|d| d.as_millis() as u64),
                    duration_ms: source.duration().map(|d| d.as_millis() as u64),
                    metadata_source: meta
                        .text(MetadataKey::MetadataSource)
                        .map(str::to_string),
                }
            }
            None => NowPlayingDto {
                source_type: "None".to_string(),
                source_name: "No Source".to_string(),
                title: DEFAULT_TITLE.to_string(),
                artist: DEFAULT_ARTIST.to_string(),
                album: DEFAULT_ALBUM.to_string(),
                album_art_url: DEFAULT_ALBUM_ART.to_string(),
                position_ms: None,
                duration_ms: None,
                metadata_source: None,
            },
        }
    }

    // ---- queue pass-through (primary source, NotFound when none) ----

    pub fn queue(&self) -> Result<Vec<QueueItem>> {
        self.require_primary()?.queue_snapshot()
    }

    pub fn add_to_queue(&self, identifier: &str, position: Option<usize>) -> Result<QueueItem> {
        self.require_primary()?.add_to_queue(identifier, position)
    }

    pub fn remove_from_queue(&self, index: usize) -> Result<()> {
        self.require_primary()?.remove_from_queue(index)
    }

    pub fn clear_queue(&self) -> Result<()> {
        self.require_primary()?.clear_queue()
    }

    pub fn move_queue_item(&self, from: usize, to: usize) -> Result<()> {
        self.require_primary()?.move_queue_item(from, to)
    }

    pub fn jump_to_index(&self, index: usize) -> Result<()> {
        self.require_primary()?.jump_to_index(index)
    }

    pub fn next(&self) -> Result<()> {
        self.require_primary()?.next()
    }

    pub fn previous(&self) -> Result<()> {
        self.require_primary()?.previous()
    }

    pub fn set_shuffle(&self, enabled: bool) -> Result<()> {
        self.require_primary()?.set_shuffle(enabled)
    }

    pub fn set_repeat(&self, mode: RepeatMode) -> Result<()> {
        self.require_primary()?.set_repeat(mode)
    }

    // ---- event sources ----

    /// Start an overlay event. Returns its id; it deregisters itself when
    /// the clip ends.
    pub fn play_event(
        &self,
        kind: EventKind,
        priority: u8,
        duck_exempt: bool,
        producer: Box<dyn ClipProducer>,
        clip_duration: Option<Duration>,
    ) -> Result<String> {
        let n = self
            .event_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let id = format!("event-{n}");

        let event = Arc::new(EventSource::new(
            id.clone(),
            kind,
            priority,
            duck_exempt,
            producer,
            clip_duration,
            Arc::clone(&self.bus),
        )?);
        event.initialize()?;
        let feed = event.take_mixer_feed()?;
        self.mixer.add_feed(feed);

        self.coordinator
            .event_started(Arc::clone(&event) as Arc<dyn AudioSource>, priority, duck_exempt)?;
        event.play()?;

        self.active_events.lock().insert(id.clone(), event);
        tracing::info!(event = %id, kind = kind.as_str(), priority, "event source playing");
        Ok(id)
    }

    /// Cancel a running event early.
    pub fn stop_event(&self, id: &str) -> Result<()> {
        let event = self
            .active_events
            .lock()
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("event {id}")))?;
        event.stop()?;
        self.mixer.remove_feed(id);
        self.coordinator.event_finished(id);
        event.dispose()?;
        Ok(())
    }

    pub fn active_event_count(&self) -> usize {
        self.active_events.lock().len()
    }

    // ---- track identification ----

    /// Overlay identified metadata onto the primary source.
    ///
    /// Only applies while the primary is Playing or Paused; anything else
    /// ignores the event. Pre-existing `Source`/`Device` keys survive
    /// because the overlay never carries them.
    pub fn apply_identification(&self, identified: TrackIdentified) {
        let Some(primary) = self.primary() else {
            return;
        };
        match primary.state() {
            SourceState::Playing | SourceState::Paused => {}
            state => {
                tracing::debug!(
                    %state,
                    "ignoring track identification while primary is not playing"
                );
                return;
            }
        }

        let mut overlay = TrackMetadata::new();
        overlay.set_text(MetadataKey::Title, identified.title.clone());
        overlay.set_text(MetadataKey::Artist, identified.artist.clone());
        if let Some(album) = &identified.album {
            overlay.set_text(MetadataKey::Album, album.clone());
        }
        if let Some(art) = &identified.album_art_url {
            overlay.set_text(MetadataKey::AlbumArtUrl, art.clone());
        }
        overlay.set(
            MetadataKey::IdentificationConfidence,
            MetadataValue::Float(identified.confidence),
        );
        overlay.set(
            MetadataKey::IdentifiedAt,
            MetadataValue::Timestamp(identified.identified_at),
        );
        overlay.set_text(MetadataKey::MetadataSource, "Fingerprinting");

        primary.merge_metadata(overlay);
        tracing::info!(
            title = %identified.title,
            artist = %identified.artist,
            confidence = identified.confidence,
            "identified track overlaid onto primary metadata"
        );
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::ducking::{DuckConfig, DuckingEngine};
    use crate::source::event::BufferedClip;
    use tempfile::TempDir;

    fn harness(root: &TempDir) -> Arc<Orchestrator> {
        let bus = Arc::new(EventBus::new());
        let ducking = Arc::new(DuckingEngine::new(DuckConfig::default()));
        let (mixer, notices) = Mixer::spawn(Arc::clone(&ducking));
        let coordinator = Arc::new(EventCoordinator::new(ducking, Arc::clone(&bus)));
        let factory = SourceFactory {
            bus: Arc::clone(&bus),
            devices: Arc::new(DeviceManager::new()),
            library_root: root.path().to_path_buf(),
            streaming_backend: None,
            streaming_catalog: None,
            sdr_frontend: Box::new(|| Box::new(crate::source::radio::OfflineFrontend::new())),
            restored_prefs: Mutex::new(HashMap::new()),
            prefs_tx: None,
        };
        Orchestrator::new(bus, Arc::new(mixer), coordinator, factory, notices)
    }

    fn write_wav(dir: &std::path::Path, name: &str, frames: u32) {
        let path = dir.join(name);
        let data_len = frames * 2;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&48_000u32.to_le_bytes());
        bytes.extend_from_slice(&(48_000u32 * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.extend(std::iter::repeat_n(0u8, data_len as usize));
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_no_source_defaults() {
        let dir = TempDir::new().unwrap();
        let orchestrator = harness(&dir);

        let now = orchestrator.now_playing();
        assert_eq!(now.source_type, "None");
        assert_eq!(now.source_name, "No Source");
        assert_eq!(now.title, "No Track");
        assert_eq!(now.artist, "--");
        assert_eq!(now.album, "--");
        assert_eq!(now.album_art_url, "/images/default-album-art.png");
        assert!(now.position_ms.is_none());

        let state = orchestrator.playback_state();
        assert!(!state.is_playing);
        assert!(!state.can_play);

        let err = orchestrator.queue().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_select_source_and_one_primary_invariant() {
        let dir = TempDir::new().unwrap();
        write_wav(dir.path(), "a.wav", 48_000);
        let orchestrator = harness(&dir);

        let file = orchestrator.select_source("file", &HashMap::new()).unwrap();
        assert_eq!(file.state(), SourceState::Ready);
        file.add_to_queue("a.wav", None).unwrap();
        file.play().unwrap();
        assert_eq!(file.state(), SourceState::Playing);

        // Selecting another source stops the playing primary first
        let radio = orchestrator.select_source("radio", &HashMap::new()).unwrap();
        assert_eq!(file.state(), SourceState::Stopped);
        assert_eq!(orchestrator.primary().unwrap().id(), radio.id());

        // At most one primary is ever Playing or Paused
        radio.play().unwrap();
        let playing = orchestrator
            .active_sources()
            .into_iter()
            .filter(|s| matches!(s.state(), SourceState::Playing | SourceState::Paused))
            .count();
        assert_eq!(playing, 1);

        orchestrator.dispose_all();
    }

    #[test]
    fn test_unknown_source_type() {
        let dir = TempDir::new().unwrap();
        let orchestrator = harness(&dir);
        let err = match orchestrator.select_source("cassette", &HashMap::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected select_source to fail"),
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_update_playback_validation() {
        let dir = TempDir::new().unwrap();
        let orchestrator = harness(&dir);

        let err = orchestrator
            .update_playback(&PlaybackUpdate {
                volume: Some(1.5),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);

        let state = orchestrator
            .update_playback(&PlaybackUpdate {
                volume: Some(0.4),
                balance: Some(-0.25),
                is_muted: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!((state.volume - 0.4).abs() < 1e-4);
        assert!((state.balance + 0.25).abs() < 1e-4);
        assert!(state.is_muted);
    }

    #[test]
    fn test_event_lifecycle_drives_ducking() {
        let dir = TempDir::new().unwrap();
        let orchestrator = harness(&dir);

        let clip = BufferedClip::tone(660.0, 0.4, Duration::from_millis(50));
        let id = orchestrator
            .play_event(EventKind::Notification, 5, false, Box::new(clip), None)
            .unwrap();
        assert_eq!(orchestrator.active_event_count(), 1);
        assert!(orchestrator.ducking_state().is_ducking);

        // The clip exhausts and the mixer notice deregisters the event
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while orchestrator.active_event_count() > 0 {
            assert!(std::time::Instant::now() < deadline, "event never deregistered");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!orchestrator.ducking_state().is_ducking);
        let _ = id;
    }

    #[test]
    fn test_nested_events_count() {
        let dir = TempDir::new().unwrap();
        let orchestrator = harness(&dir);

        let a = orchestrator
            .play_event(
                EventKind::Chime,
                3,
                false,
                Box::new(BufferedClip::tone(440.0, 0.3, Duration::from_secs(5))),
                None,
            )
            .unwrap();
        let b = orchestrator
            .play_event(
                EventKind::Notification,
                3,
                false,
                Box::new(BufferedClip::tone(550.0, 0.3, Duration::from_secs(5))),
                None,
            )
            .unwrap();
        assert_eq!(orchestrator.ducking_state().active_event_count, 2);

        orchestrator.stop_event(&a).unwrap();
        assert_eq!(orchestrator.ducking_state().active_event_count, 1);
        assert!(orchestrator.ducking_state().is_ducking);

        orchestrator.stop_event(&b).unwrap();
        assert_eq!(orchestrator.ducking_state().active_event_count, 0);
        assert!(!orchestrator.ducking_state().is_ducking);
    }

    #[test]
    fn test_identification_gating() {
        let dir = TempDir::new().unwrap();
        write_wav(dir.path(), "a.wav", 48_000);
        let orchestrator = harness(&dir);
        let file = orchestrator.select_source("file", &HashMap::new()).unwrap();

        let identified = TrackIdentified {
            title: "X".to_string(),
            artist: "Y".to_string(),
            album: None,
            album_art_url: None,
            confidence: 0.93,
            identified_at: Utc::now(),
        };

        // Ready: ignored
        orchestrator.apply_identification(identified.clone());
        assert_ne!(file.metadata().display_title(), "X");

        // Playing: overlaid, Source/Device keys preserved
        file.add_to_queue("a.wav", None).unwrap();
        file.play().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !file.metadata().contains(MetadataKey::Source) {
            assert!(std::time::Instant::now() < deadline, "track never loaded");
            std::thread::sleep(Duration::from_millis(10));
        }

        orchestrator.apply_identification(identified);
        let meta = file.metadata();
        assert_eq!(meta.display_title(), "X");
        assert_eq!(meta.display_artist(), "Y");
        assert_eq!(meta.text(MetadataKey::MetadataSource), Some("Fingerprinting"));
        assert!(meta.get(MetadataKey::IdentificationConfidence).is_some());
        assert_eq!(meta.text(MetadataKey::Source), Some("File"));

        orchestrator.dispose_all();
    }
}
