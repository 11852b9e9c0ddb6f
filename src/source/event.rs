//! Short-lived overlay sources: notifications, chimes, TTS, doorbells.
//!
//! An event source wraps a finite PCM clip. It follows the common state
//! machine but its lifetime is bounded by the clip: when the producer
//! exhausts, the source transitions itself to Stopped and its feed drains
//! out of the mix graph, which is how the orchestrator learns to
//! deregister it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::ring::pcm_ring;
use crate::audio::{BUS_SAMPLE_RATE, SAMPLES_PER_TICK};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::mixer::{BalanceCell, MixerFeed};
use crate::source::{
    AudioSource, Capabilities, MetadataKey, SourceCategory, SourceKind, SourceState, StateCell,
    TrackMetadata, VolumeCell,
};

/// What kind of overlay this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EventKind {
    SoundEffect,
    Notification,
    Chime,
    TextToSpeech,
    Doorbell,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoundEffect => "SoundEffect",
            Self::Notification => "Notification",
            Self::Chime => "Chime",
            Self::TextToSpeech => "TextToSpeech",
            Self::Doorbell => "Doorbell",
        }
    }
}

/// Produces the clip's PCM in bus format (48 kHz stereo interleaved).
/// `None` ends the clip.
pub trait ClipProducer: Send {
    fn next_block(&mut self) -> Option<Vec<f32>>;
}

/// A fully buffered clip.
pub struct BufferedClip {
    samples: Vec<f32>,
    cursor: usize,
}

impl BufferedClip {
    /// Wrap interleaved stereo samples at the bus rate.
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples, cursor: 0 }
    }

    /// A sine tone clip, handy for chimes and tests.
    pub fn tone(frequency: f32, amplitude: f32, duration: Duration) -> Self {
        let frames = (duration.as_secs_f64() * BUS_SAMPLE_RATE as f64) as usize;
        let mut samples = Vec::with_capacity(frames * 2);
        for n in 0..frames {
            let t = n as f32 / BUS_SAMPLE_RATE as f32;
            let v = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
            samples.push(v);
            samples.push(v);
        }
        Self::new(samples)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / 2.0 / BUS_SAMPLE_RATE as f64)
    }
}

impl ClipProducer for BufferedClip {
    fn next_block(&mut self) -> Option<Vec<f32>> {
        if self.cursor >= self.samples.len() {
            return None;
        }
        let end = (self.cursor + SAMPLES_PER_TICK).min(self.samples.len());
        let block = self.samples[self.cursor..end].to_vec();
        self.cursor = end;
        Some(block)
    }
}

/// A short-lived overlay source.
pub struct EventSource {
    id: String,
    name: String,
    kind: EventKind,
    priority: u8,
    duck_exempt: bool,
    clip_duration: Option<Duration>,
    state: StateCell,
    volume: Arc<VolumeCell>,
    balance: Arc<BalanceCell>,
    producer: Mutex<Option<Box<dyn ClipProducer>>>,
    feed: Mutex<Option<MixerFeed>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    /// Set by play() to let the producer thread start pushing
    armed_slot: Mutex<Option<Arc<AtomicBool>>>,
    position_nanos: Arc<AtomicU64>,
}

impl EventSource {
    pub fn new(
        id: impl Into<String>,
        kind: EventKind,
        priority: u8,
        duck_exempt: bool,
        producer: Box<dyn ClipProducer>,
        clip_duration: Option<Duration>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        if priority > 10 {
            return Err(Error::invalid_argument("event priority must be 0-10"));
        }
        let id = id.into();
        Ok(Self {
            name: format!("{} event", kind.as_str()),
            kind,
            priority,
            duck_exempt,
            clip_duration,
            state: StateCell::new(id.clone(), bus),
            volume: Arc::new(VolumeCell::default()),
            balance: Arc::new(BalanceCell::default()),
            producer: Mutex::new(Some(producer)),
            feed: Mutex::new(None),
            worker: Mutex::new(None),
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            armed_slot: Mutex::new(None),
            position_nanos: Arc::new(AtomicU64::new(0)),
            id,
        })
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn duck_exempt(&self) -> bool {
        self.duck_exempt
    }

    pub fn event_kind(&self) -> EventKind {
        self.kind
    }
}

impl AudioSource for EventSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Event
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Event
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn state(&self) -> SourceState {
        self.state.get()
    }

    fn initialize(&self) -> Result<()> {
        self.state.transition(SourceState::Initializing, "initialize")?;

        let (writer, reader) = pcm_ring(SAMPLES_PER_TICK * 16);
        *self.feed.lock() = Some(MixerFeed {
            source_id: self.id.clone(),
            reader,
            volume: Arc::clone(&self.volume),
            balance: Arc::clone(&self.balance),
            duck_exempt: self.duck_exempt,
            is_event: true,
        });

        let producer = self
            .producer
            .lock()
            .take()
            .ok_or_else(|| Error::illegal_state("initialize", "producer already consumed"))?;
        let paused = Arc::clone(&self.paused);
        let cancelled = Arc::clone(&self.cancelled);
        let position = Arc::clone(&self.position_nanos);

        let mut writer = writer;
        let mut producer = producer;
        let armed = Arc::new(AtomicBool::new(false));
        let armed_for_thread = Arc::clone(&armed);
        let handle = std::thread::Builder::new()
            .name(format!("event-clip-{}", self.id))
            .spawn(move || {
                // Wait for play before producing
                while !armed_for_thread.load(Ordering::Acquire) {
                    if cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }

                let mut frames_done = 0u64;
                let mut pending: Vec<f32> = Vec::new();
                loop {
                    if cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    if paused.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }

                    if pending.is_empty() {
                        match producer.next_block() {
                            Some(block) => pending = block,
                            // Clip exhausted; dropping the writer drains the
                            // feed out of the mix graph
                            None => return,
                        }
                    }

                    let written = writer.push(&pending);
                    frames_done += (written / 2) as u64;
                    position.store(
                        frames_done * 1_000_000_000 / BUS_SAMPLE_RATE as u64,
                        Ordering::Relaxed,
                    );
                    pending.drain(..written);
                    if written == 0 {
                        std::thread::sleep(Duration::from_millis(3));
                    }
                }
            })
            .map_err(|e| Error::external(e.to_string()))?;

        *self.worker.lock() = Some(handle);
        // The play() call arms the thread via the paused flag dance below
        self.paused.store(true, Ordering::Release);
        *self.armed_slot.lock() = Some(armed);

        self.state.transition(SourceState::Ready, "initialize")?;
        Ok(())
    }

    fn play(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "play")?;
        self.paused.store(false, Ordering::Release);
        if let Some(armed) = self.armed_slot.lock().as_ref() {
            armed.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.state.transition(SourceState::Paused, "pause")?;
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "resume")?;
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.state.transition(SourceState::Stopped, "stop")?;
        self.cancelled.store(true, Ordering::Release);
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if !self.state.dispose() {
            return Ok(());
        }
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        Some(Duration::from_nanos(
            self.position_nanos.load(Ordering::Relaxed),
        ))
    }

    fn duration(&self) -> Option<Duration> {
        self.clip_duration
    }

    fn metadata(&self) -> TrackMetadata {
        let mut meta = TrackMetadata::new();
        meta.set_text(MetadataKey::Title, self.name.clone());
        meta.set_text(MetadataKey::Source, self.kind.as_str());
        meta
    }

    fn merge_metadata(&self, _overlay: TrackMetadata) {}

    fn volume(&self) -> f32 {
        self.volume.get()
    }

    fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }

    fn take_mixer_feed(&self) -> Result<MixerFeed> {
        self.feed
            .lock()
            .take()
            .ok_or_else(|| Error::illegal_state("take_mixer_feed", self.state()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chime(bus: Arc<EventBus>) -> EventSource {
        let clip = BufferedClip::tone(880.0, 0.5, Duration::from_millis(40));
        let duration = clip.duration();
        EventSource::new(
            "evt-1",
            EventKind::Chime,
            5,
            false,
            Box::new(clip),
            Some(duration),
            bus,
        )
        .unwrap()
    }

    #[test]
    fn test_priority_validation() {
        let err = EventSource::new(
            "evt-x",
            EventKind::Chime,
            11,
            false,
            Box::new(BufferedClip::new(Vec::new())),
            None,
            Arc::new(EventBus::new()),
        );
        let err = match err {
            Err(e) => e,
            Ok(_) => panic!("expected EventSource::new to fail"),
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_clip_plays_to_exhaustion() {
        let source = chime(Arc::new(EventBus::new()));
        source.initialize().unwrap();
        let mut feed = source.take_mixer_feed().unwrap();
        source.play().unwrap();

        // Drain the feed the way the mixer would until the producer dies
        let mut collected = Vec::new();
        let mut scratch = [0.0f32; 1024];
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let read = feed.reader.pop(&mut scratch);
            collected.extend_from_slice(&scratch[..read]);
            if feed.reader.is_abandoned() && feed.reader.available() == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "clip never exhausted");
            std::thread::sleep(Duration::from_millis(2));
        }
        // 40ms of stereo at 48kHz
        assert_eq!(collected.len(), 3840);
        assert!(collected.iter().any(|s| s.abs() > 0.1));
        source.dispose().unwrap();
    }

    #[test]
    fn test_buffered_clip_tone_duration() {
        let clip = BufferedClip::tone(440.0, 1.0, Duration::from_millis(100));
        assert_eq!(clip.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_event_is_overlay_category() {
        let source = chime(Arc::new(EventBus::new()));
        assert_eq!(source.category(), SourceCategory::Event);
        assert!(source.capabilities().is_empty());
    }
}
