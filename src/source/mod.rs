//! Audio source contract and the shared state machine.
//!
//! Every source variant (file player, SDR radio, USB line-in, streaming,
//! event clips) implements [`AudioSource`]. The contract covers:
//!
//! - the common lifecycle state machine (validated in [`StateCell`])
//! - capability flags the control surface uses to light up buttons
//! - a typed metadata map with standard keys
//! - a one-shot handoff of the source's PCM feed to the mixer
//!
//! Queue, radio and streaming controls are part of the trait with
//! `NotSupported` defaults so callers hold plain `Arc<dyn AudioSource>`
//! handles; the closed variant set overrides what it actually supports.

pub mod decoder;
pub mod event;
pub mod file;
pub mod line_in;
pub mod queue;
pub mod radio;
pub mod streaming;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::mixer::MixerFeed;
use queue::{QueueItem, RepeatMode};

pub use file::FileControl;
pub use radio::RadioControl;
pub use streaming::StreamingControl;

/// Default metadata substituted at the DTO boundary.
pub const DEFAULT_TITLE: &str = "No Track";
pub const DEFAULT_ARTIST: &str = "--";
pub const DEFAULT_ALBUM: &str = "--";
pub const DEFAULT_ALBUM_ART: &str = "/images/default-album-art.png";

/// Lifecycle state shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum SourceState {
    #[default]
    Created,
    Initializing,
    Ready,
    Playing,
    Paused,
    Stopped,
    Error,
    Disposed,
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Disposed => "Disposed",
        };
        f.write_str(s)
    }
}

impl SourceState {
    /// Whether the machine allows moving from `self` to `to`.
    ///
    /// Disposed is terminal; Error is reachable from anywhere but only
    /// leads back through Initializing.
    pub fn allows(self, to: SourceState) -> bool {
        use SourceState::*;
        match (self, to) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Error, Initializing) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Created, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Playing) | (Stopped, Playing) | (Paused, Playing) => true,
            (Playing, Paused) => true,
            (Playing, Stopped) | (Paused, Stopped) => true,
            _ => false,
        }
    }
}

/// What a source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SourceKind {
    FilePlayer,
    SdrRadio,
    Turntable,
    UsbGeneric,
    Streaming,
    Event,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FilePlayer => "File",
            Self::SdrRadio => "Radio",
            Self::Turntable => "Vinyl",
            Self::UsbGeneric => "UsbLineIn",
            Self::Streaming => "Streaming",
            Self::Event => "Event",
        }
    }
}

/// Primary sources own the program stream; event sources overlay it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SourceCategory {
    Primary,
    Event,
}

bitflags::bitflags! {
    /// Capability flags, surfaced in the playback DTO as can_* fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const SEEKABLE  = 1 << 0;
        const QUEUE     = 1 << 1;
        const NEXT      = 1 << 2;
        const PREVIOUS  = 1 << 3;
        const SHUFFLE   = 1 << 4;
        const REPEAT    = 1 << 5;
    }
}

/// Standard metadata keys. The set is closed; there are no free-form keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum MetadataKey {
    Title,
    Artist,
    Album,
    AlbumArtUrl,
    Duration,
    TrackNumber,
    Genre,
    Year,
    Source,
    Device,
    IdentificationConfidence,
    IdentifiedAt,
    MetadataSource,
}

/// Typed metadata values.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A source's metadata map.
///
/// Sources may carry absent keys; defaults are substituted when the
/// orchestrator composes DTOs, not here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata(BTreeMap<MetadataKey, MetadataValue>);

impl TrackMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: MetadataKey) -> Option<&MetadataValue> {
        self.0.get(&key)
    }

    pub fn text(&self, key: MetadataKey) -> Option<&str> {
        self.0.get(&key).and_then(MetadataValue::as_text)
    }

    pub fn set(&mut self, key: MetadataKey, value: MetadataValue) {
        self.0.insert(key, value);
    }

    pub fn set_text(&mut self, key: MetadataKey, value: impl Into<String>) {
        self.0.insert(key, MetadataValue::Text(value.into()));
    }

    pub fn remove(&mut self, key: MetadataKey) -> Option<MetadataValue> {
        self.0.remove(&key)
    }

    pub fn contains(&self, key: MetadataKey) -> bool {
        self.0.contains_key(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetadataKey, &MetadataValue)> {
        self.0.iter()
    }

    /// Title with the default substituted; never empty.
    pub fn display_title(&self) -> &str {
        match self.text(MetadataKey::Title) {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_TITLE,
        }
    }

    pub fn display_artist(&self) -> &str {
        match self.text(MetadataKey::Artist) {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_ARTIST,
        }
    }

    pub fn display_album(&self) -> &str {
        match self.text(MetadataKey::Album) {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_ALBUM,
        }
    }

    pub fn display_album_art(&self) -> &str {
        match self.text(MetadataKey::AlbumArtUrl) {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_ALBUM_ART,
        }
    }
}

/// Volume stored as f32 bits in an atomic, readable from the pull loop.
#[derive(Debug)]
pub struct VolumeCell(AtomicU32);

impl Default for VolumeCell {
    fn default() -> Self {
        Self(AtomicU32::new(1.0_f32.to_bits()))
    }
}

impl VolumeCell {
    pub fn new(volume: f32) -> Self {
        Self(AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()))
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Clamp to [0,1]; setting a value within 1e-4 of the current one is
    /// a no-op. Returns whether the value changed.
    pub fn set(&self, volume: f32) -> bool {
        let clamped = volume.clamp(0.0, 1.0);
        if (clamped - self.get()).abs() < 1e-4 {
            return false;
        }
        self.0.store(clamped.to_bits(), Ordering::Relaxed);
        true
    }
}

/// Source-local state cell: validates transitions and publishes
/// `StateChanged` in program order.
pub struct StateCell {
    source_id: String,
    state: RwLock<SourceState>,
    bus: Arc<EventBus>,
}

impl StateCell {
    pub fn new(source_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            source_id: source_id.into(),
            state: RwLock::new(SourceState::Created),
            bus,
        }
    }

    pub fn get(&self) -> SourceState {
        *self.state.read()
    }

    /// Attempt the transition for `operation`; publishes on success.
    pub fn transition(&self, to: SourceState, operation: &str) -> Result<SourceState> {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous == SourceState::Disposed {
            return Err(Error::AlreadyDisposed);
        }
        if !previous.allows(to) {
            return Err(Error::illegal_state(operation, previous));
        }
        *guard = to;
        drop(guard);

        tracing::debug!(
            target: "source::events",
            source = %self.source_id,
            "{previous} -> {to} ({operation})"
        );
        self.bus.publish(EngineEvent::StateChanged {
            source_id: self.source_id.clone(),
            previous,
            new: to,
            error: None,
        });
        Ok(previous)
    }

    /// Move to Error, recording the cause. Allowed from any live state.
    pub fn fail(&self, error: &Error) {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous == SourceState::Disposed || previous == SourceState::Error {
            return;
        }
        *guard = SourceState::Error;
        drop(guard);

        tracing::warn!(source = %self.source_id, "source entered Error: {error}");
        self.bus.publish(EngineEvent::StateChanged {
            source_id: self.source_id.clone(),
            previous,
            new: SourceState::Error,
            error: Some(error.to_string()),
        });
    }

    /// Dispose is idempotent: the first call transitions, later calls
    /// report success without publishing.
    pub fn dispose(&self) -> bool {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous == SourceState::Disposed {
            return false;
        }
        *guard = SourceState::Disposed;
        drop(guard);

        self.bus.publish(EngineEvent::StateChanged {
            source_id: self.source_id.clone(),
            previous,
            new: SourceState::Disposed,
            error: None,
        });
        true
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

/// The uniform contract implemented by every source variant.
pub trait AudioSource: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> SourceKind;
    fn category(&self) -> SourceCategory {
        SourceCategory::Primary
    }
    fn capabilities(&self) -> Capabilities;
    fn state(&self) -> SourceState;

    fn initialize(&self) -> Result<()>;
    fn play(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn dispose(&self) -> Result<()>;

    /// Seek within the current item. Fails with `NotSupported` for
    /// non-seekable variants, `IllegalState` outside Playing/Paused.
    fn seek(&self, position: Duration) -> Result<()> {
        let _ = position;
        Err(Error::not_supported(format!(
            "{} is not seekable",
            self.kind().as_str()
        )))
    }

    fn position(&self) -> Option<Duration>;
    /// None for live sources.
    fn duration(&self) -> Option<Duration> {
        None
    }

    fn metadata(&self) -> TrackMetadata;

    /// Merge an overlay into the metadata map (identification hook).
    fn merge_metadata(&self, overlay: TrackMetadata);

    fn volume(&self) -> f32;
    fn set_volume(&self, volume: f32);

    /// Hand the source's PCM feed to the mixer. Single-shot: the feed
    /// can only be taken once per initialize.
    fn take_mixer_feed(&self) -> Result<MixerFeed>;

    // ---- queue operations (overridden by variants with a queue) ----

    fn queue_snapshot(&self) -> Result<Vec<QueueItem>> {
        Err(self.no_queue())
    }
    fn add_to_queue(&self, identifier: &str, position: Option<usize>) -> Result<QueueItem> {
        let _ = (identifier, position);
        Err(self.no_queue())
    }
    fn remove_from_queue(&self, index: usize) -> Result<()> {
        let _ = index;
        Err(self.no_queue())
    }
    fn clear_queue(&self) -> Result<()> {
        Err(self.no_queue())
    }
    fn move_queue_item(&self, from: usize, to: usize) -> Result<()> {
        let _ = (from, to);
        Err(self.no_queue())
    }
    fn jump_to_index(&self, index: usize) -> Result<()> {
        let _ = index;
        Err(self.no_queue())
    }
    fn next(&self) -> Result<()> {
        Err(self.no_queue())
    }
    fn previous(&self) -> Result<()> {
        Err(self.no_queue())
    }
    fn set_shuffle(&self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Err(self.no_queue())
    }
    fn shuffle_enabled(&self) -> bool {
        false
    }
    fn set_repeat(&self, mode: RepeatMode) -> Result<()> {
        let _ = mode;
        Err(self.no_queue())
    }
    fn repeat_mode(&self) -> RepeatMode {
        RepeatMode::Off
    }

    // ---- variant-specific control facets ----

    fn as_radio(&self) -> Option<&dyn RadioControl> {
        None
    }
    fn as_streaming(&self) -> Option<&dyn StreamingControl> {
        None
    }
    fn as_files(&self) -> Option<&dyn FileControl> {
        None
    }

    #[doc(hidden)]
    fn no_queue(&self) -> Error {
        Error::not_supported(format!("{} has no queue", self.kind().as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [SourceState; 8] = [
        SourceState::Created,
        SourceState::Initializing,
        SourceState::Ready,
        SourceState::Playing,
        SourceState::Paused,
        SourceState::Stopped,
        SourceState::Error,
        SourceState::Disposed,
    ];

    #[test]
    fn test_happy_path_transitions() {
        use SourceState::*;
        assert!(Created.allows(Initializing));
        assert!(Initializing.allows(Ready));
        assert!(Ready.allows(Playing));
        assert!(Playing.allows(Paused));
        assert!(Paused.allows(Playing));
        assert!(Playing.allows(Stopped));
        assert!(Stopped.allows(Playing));
    }

    #[test]
    fn test_disposed_is_terminal() {
        for to in ALL_STATES {
            assert!(!SourceState::Disposed.allows(to), "Disposed -> {to}");
        }
    }

    #[test]
    fn test_error_only_reinitializes() {
        for to in ALL_STATES {
            let expected = matches!(to, SourceState::Initializing | SourceState::Disposed);
            assert_eq!(SourceState::Error.allows(to), expected, "Error -> {to}");
        }
    }

    #[test]
    fn test_state_cell_publishes_in_order() {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let cell = StateCell::new("s1", bus);

        cell.transition(SourceState::Initializing, "initialize").unwrap();
        cell.transition(SourceState::Ready, "initialize").unwrap();
        cell.transition(SourceState::Playing, "play").unwrap();

        let states: Vec<SourceState> = rx
            .try_iter()
            .map(|e| match e {
                EngineEvent::StateChanged { new, .. } => new,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(
            states,
            vec![SourceState::Initializing, SourceState::Ready, SourceState::Playing]
        );
    }

    #[test]
    fn test_state_cell_rejects_bad_transition() {
        let cell = StateCell::new("s1", Arc::new(EventBus::new()));
        let err = cell.transition(SourceState::Paused, "pause").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
    }

    #[test]
    fn test_dispose_idempotent_and_terminal() {
        let cell = StateCell::new("s1", Arc::new(EventBus::new()));
        assert!(cell.dispose());
        assert!(!cell.dispose());
        let err = cell
            .transition(SourceState::Initializing, "initialize")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyDisposed);
    }

    #[test]
    fn test_volume_cell_clamp_and_deadband() {
        let cell = VolumeCell::default();
        assert!(cell.set(1.5));
        assert_eq!(cell.get(), 1.0);
        assert!(cell.set(0.5));
        assert!(!cell.set(0.50005)); // within 1e-4
        assert_eq!(cell.get(), 0.5);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = TrackMetadata::new();
        assert_eq!(meta.display_title(), DEFAULT_TITLE);
        assert_eq!(meta.display_artist(), DEFAULT_ARTIST);
        assert_eq!(meta.display_album(), DEFAULT_ALBUM);
        assert_eq!(meta.display_album_art(), DEFAULT_ALBUM_ART);

        let mut meta = TrackMetadata::new();
        meta.set_text(MetadataKey::Title, "");
        assert_eq!(meta.display_title(), DEFAULT_TITLE);
    }

    proptest! {
        /// No sequence of attempted transitions can escape the machine:
        /// whatever the cell ends up in is reachable per the edge table.
        #[test]
        fn prop_state_trajectory_stays_legal(ops in proptest::collection::vec(0usize..ALL_STATES.len(), 1..40)) {
            let cell = StateCell::new("p", Arc::new(EventBus::new()));
            let mut current = cell.get();
            for op in ops {
                let target = ALL_STATES[op];
                let allowed = current != SourceState::Disposed && current.allows(target);
                match cell.transition(target, "prop") {
                    Ok(prev) => {
                        prop_assert!(allowed, "{prev} -> {target} should have been rejected");
                        current = target;
                    }
                    Err(_) => {
                        prop_assert!(!allowed, "{current} -> {target} should have been allowed");
                    }
                }
            }
            prop_assert_eq!(cell.get(), current);
        }
    }
}
