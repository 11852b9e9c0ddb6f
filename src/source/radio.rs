//! SDR radio tuner source.
//!
//! Demodulation itself lives behind [`SdrFrontend`]; this module owns the
//! tuner state machine around it: band/frequency/step bookkeeping, scan
//! logic, gain control and the producer thread that moves demodulated
//! audio into the mix graph. Tuning away from a station resets metadata
//! to the source defaults; an external identification service may overlay
//! track info afterwards through the orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::audio::ring::pcm_ring;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::mixer::{BalanceCell, MixerFeed};
use crate::source::{
    AudioSource, Capabilities, MetadataKey, SourceKind, SourceState, StateCell, TrackMetadata,
    VolumeCell,
};

/// Supported bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Band {
    Am,
    Fm,
    Wb,
    Vhf,
    Sw,
}

impl Band {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AM" => Ok(Self::Am),
            "FM" => Ok(Self::Fm),
            "WB" => Ok(Self::Wb),
            "VHF" => Ok(Self::Vhf),
            "SW" => Ok(Self::Sw),
            other => Err(Error::invalid_argument(format!("unknown band: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Am => "AM",
            Self::Fm => "FM",
            Self::Wb => "WB",
            Self::Vhf => "VHF",
            Self::Sw => "SW",
        }
    }

    /// Tunable range in Hz.
    pub fn range(&self) -> (u64, u64) {
        match self {
            Self::Am => (520_000, 1_710_000),
            Self::Fm => (87_500_000, 108_000_000),
            Self::Wb => (162_400_000, 162_550_000),
            Self::Vhf => (30_000_000, 300_000_000),
            Self::Sw => (2_300_000, 26_100_000),
        }
    }

    /// Default tuning frequency in Hz.
    pub fn default_frequency(&self) -> u64 {
        match self {
            Self::Am => 1_000_000,
            Self::Fm => 98_500_000,
            Self::Wb => 162_400_000,
            Self::Vhf => 146_520_000,
            Self::Sw => 9_700_000,
        }
    }

    /// Default scan/tune step in Hz.
    pub fn default_step(&self) -> u64 {
        match self {
            Self::Am => 9_000,
            Self::Fm => 100_000,
            Self::Wb => 25_000,
            Self::Vhf => 12_500,
            Self::Sw => 5_000,
        }
    }
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    Up,
    Down,
}

/// Equalizer modes the tuner accepts.
pub const EQUALIZER_MODES: &[&str] = &["flat", "rock", "jazz", "classical", "pop", "speech"];

/// Signal quality reported by the front end.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalQuality {
    /// 0-100
    pub strength: u8,
    pub stereo: bool,
}

/// The demodulation front end. Blocks of bus-format audio come out of
/// `read_block`; everything else is tuner control.
pub trait SdrFrontend: Send {
    fn tune(&mut self, frequency_hz: u64, band: Band) -> Result<()>;
    fn set_gain(&mut self, db: f32) -> Result<()>;
    fn set_auto_gain(&mut self, enabled: bool) -> Result<()>;
    fn signal_quality(&self) -> SignalQuality;
    /// Demodulated audio, 48 kHz stereo interleaved. Blocks briefly.
    fn read_block(&mut self) -> Vec<f32>;
}

/// Built-in front end used when no SDR hardware is wired up: silent
/// audio, strong signal on a few canned station frequencies.
pub struct OfflineFrontend {
    tuned: u64,
    stations: Vec<u64>,
}

impl OfflineFrontend {
    pub fn new() -> Self {
        Self {
            tuned: 0,
            stations: vec![89_100_000, 98_500_000, 101_500_000, 1_000_000],
        }
    }
}

impl Default for OfflineFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl SdrFrontend for OfflineFrontend {
    fn tune(&mut self, frequency_hz: u64, _band: Band) -> Result<()> {
        self.tuned = frequency_hz;
        Ok(())
    }

    fn set_gain(&mut self, _db: f32) -> Result<()> {
        Ok(())
    }

    fn set_auto_gain(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn signal_quality(&self) -> SignalQuality {
        let on_station = self
            .stations
            .iter()
            .any(|s| s.abs_diff(self.tuned) < 50_000);
        SignalQuality {
            strength: if on_station { 82 } else { 7 },
            stereo: on_station,
        }
    }

    fn read_block(&mut self) -> Vec<f32> {
        std::thread::sleep(Duration::from_millis(10));
        vec![0.0; crate::audio::SAMPLES_PER_TICK]
    }
}

/// Tuner state snapshot published to the control surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RadioState {
    pub frequency_hz: u64,
    pub band: Band,
    pub step_hz: u64,
    pub signal_strength: u8,
    pub stereo: bool,
    pub is_scanning: bool,
    pub scan_direction: Option<ScanDirection>,
    pub equalizer_mode: String,
    pub device_volume: u8,
    pub gain_db: f32,
    pub auto_gain: bool,
    pub running: bool,
}

/// Radio-specific control facet, reached through `as_radio()`.
pub trait RadioControl: Send + Sync {
    fn radio_state(&self) -> RadioState;
    fn set_frequency(&self, hz: u64) -> Result<()>;
    fn set_band(&self, band: &str) -> Result<()>;
    fn set_step(&self, hz: u64) -> Result<()>;
    fn scan_start(&self, direction: ScanDirection) -> Result<()>;
    fn scan_stop(&self) -> Result<()>;
    fn set_equalizer_mode(&self, mode: &str) -> Result<()>;
    fn set_device_volume(&self, volume: u8) -> Result<()>;
    fn set_gain(&self, db: f32) -> Result<()>;
    fn set_auto_gain(&self, enabled: bool) -> Result<()>;
}

enum TunerCmd {
    Tune { frequency_hz: u64, band: Band },
    SetGain(f32),
    SetAutoGain(bool),
    Scan { direction: ScanDirection, step_hz: u64 },
    ScanStop,
    Run(bool),
    Shutdown,
}

#[derive(Debug, Clone)]
struct TunerSettings {
    frequency_hz: u64,
    band: Band,
    step_hz: u64,
    equalizer_mode: String,
    device_volume: u8,
    gain_db: f32,
    auto_gain: bool,
    is_scanning: bool,
    scan_direction: Option<ScanDirection>,
}

impl Default for TunerSettings {
    fn default() -> Self {
        let band = Band::Fm;
        Self {
            frequency_hz: band.default_frequency(),
            band,
            step_hz: band.default_step(),
            equalizer_mode: "flat".to_string(),
            device_volume: 70,
            gain_db: 20.0,
            auto_gain: true,
            is_scanning: false,
            scan_direction: None,
        }
    }
}

pub struct SdrRadio {
    id: String,
    name: String,
    state: StateCell,
    volume: Arc<VolumeCell>,
    balance: Arc<BalanceCell>,
    settings: Mutex<TunerSettings>,
    metadata: Mutex<TrackMetadata>,
    feed: Mutex<Option<MixerFeed>>,
    frontend: Mutex<Option<Box<dyn SdrFrontend>>>,
    worker: Mutex<Option<Worker>>,
    /// Updated by the worker from the front end
    signal_strength: Arc<AtomicU8>,
    stereo: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    /// Worker writes the frequency a completed scan landed on
    scan_result: Arc<Mutex<Option<u64>>>,
}

struct Worker {
    tx: Sender<TunerCmd>,
    handle: JoinHandle<()>,
}

impl SdrRadio {
    pub fn new(
        id: impl Into<String>,
        frontend: Box<dyn SdrFrontend>,
        bus: Arc<EventBus>,
    ) -> Self {
        let id = id.into();
        Self {
            name: "SDR Radio".to_string(),
            state: StateCell::new(id.clone(), bus),
            volume: Arc::new(VolumeCell::default()),
            balance: Arc::new(BalanceCell::default()),
            settings: Mutex::new(TunerSettings::default()),
            metadata: Mutex::new(Self::default_metadata(&TunerSettings::default())),
            feed: Mutex::new(None),
            frontend: Mutex::new(Some(frontend)),
            worker: Mutex::new(None),
            signal_strength: Arc::new(AtomicU8::new(0)),
            stereo: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            scan_result: Arc::new(Mutex::new(None)),
            id,
        }
    }

    fn default_metadata(settings: &TunerSettings) -> TrackMetadata {
        let mut meta = TrackMetadata::new();
        meta.set_text(
            MetadataKey::Title,
            format_frequency(settings.frequency_hz, settings.band),
        );
        meta.set_text(MetadataKey::Artist, format!("{} Radio", settings.band.as_str()));
        meta.set_text(MetadataKey::Source, "Radio");
        meta
    }

    fn send(&self, cmd: TunerCmd) {
        if let Some(worker) = self.worker.lock().as_ref() {
            let _ = worker.tx.send(cmd);
        }
    }

    /// Reset metadata to tuner defaults and announce the change. Called
    /// on every frequency/band move.
    fn reset_metadata(&self) {
        let settings = self.settings.lock().clone();
        *self.metadata.lock() = Self::default_metadata(&settings);
        self.state.bus().publish(EngineEvent::MetadataChanged {
            source_id: self.id.clone(),
        });
        self.publish_radio_state();
    }

    fn publish_radio_state(&self) {
        self.state.bus().publish(EngineEvent::RadioStateChanged {
            source_id: self.id.clone(),
        });
    }

    /// Fold a completed scan's landing frequency back into settings.
    fn absorb_scan_result(&self) {
        if let Some(landed) = self.scan_result.lock().take() {
            let mut settings = self.settings.lock();
            settings.frequency_hz = landed;
            settings.is_scanning = false;
            settings.scan_direction = None;
            drop(settings);
            self.reset_metadata();
        }
    }
}

impl AudioSource for SdrRadio {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SdrRadio
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn state(&self) -> SourceState {
        self.state.get()
    }

    fn initialize(&self) -> Result<()> {
        self.state.transition(SourceState::Initializing, "initialize")?;

        let mut frontend = self
            .frontend
            .lock()
            .take()
            .ok_or_else(|| Error::illegal_state("initialize", "front end already consumed"))?;

        let settings = self.settings.lock().clone();
        frontend
            .tune(settings.frequency_hz, settings.band)
            .inspect_err(|e| self.state.fail(e))?;

        let (writer, reader) = pcm_ring(96_000);
        *self.feed.lock() = Some(MixerFeed {
            source_id: self.id.clone(),
            reader,
            volume: Arc::clone(&self.volume),
            balance: Arc::clone(&self.balance),
            duck_exempt: false,
            is_event: false,
        });

        let (tx, rx) = bounded(32);
        let signal = Arc::clone(&self.signal_strength);
        let stereo = Arc::clone(&self.stereo);
        let scan_result = Arc::clone(&self.scan_result);
        let mut writer = writer;
        let handle = std::thread::Builder::new()
            .name(format!("sdr-{}", self.id))
            .spawn(move || {
                tuner_loop(frontend, rx, &mut writer, signal, stereo, scan_result);
            })
            .map_err(|e| Error::external(e.to_string()))?;
        *self.worker.lock() = Some(Worker { tx, handle });

        self.state.transition(SourceState::Ready, "initialize")?;
        Ok(())
    }

    fn play(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "play")?;
        self.running.store(true, Ordering::Release);
        self.send(TunerCmd::Run(true));
        self.publish_radio_state();
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.state.transition(SourceState::Paused, "pause")?;
        self.running.store(false, Ordering::Release);
        self.send(TunerCmd::Run(false));
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "resume")?;
        self.running.store(true, Ordering::Release);
        self.send(TunerCmd::Run(true));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.state.transition(SourceState::Stopped, "stop")?;
        self.running.store(false, Ordering::Release);
        self.send(TunerCmd::Run(false));
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if !self.state.dispose() {
            return Ok(());
        }
        self.send(TunerCmd::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.handle.join();
        }
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        None
    }

    fn metadata(&self) -> TrackMetadata {
        self.absorb_scan_result();
        self.metadata.lock().clone()
    }

    fn merge_metadata(&self, overlay: TrackMetadata) {
        let mut metadata = self.metadata.lock();
        for (key, value) in overlay.iter() {
            metadata.set(*key, value.clone());
        }
        drop(metadata);
        self.state.bus().publish(EngineEvent::MetadataChanged {
            source_id: self.id.clone(),
        });
    }

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

    fn as_radio(&self) -> Option<&dyn RadioControl> {
        Some(self)
    }
}

impl RadioControl for SdrRadio {
    fn radio_state(&self) -> RadioState {
        self.absorb_scan_result();
        let settings = self.settings.lock().clone();
        RadioState {
            frequency_hz: settings.frequency_hz,
            band: settings.band,
            step_hz: settings.step_hz,
            signal_strength: self.signal_strength.load(Ordering::Relaxed),
            stereo: self.stereo.load(Ordering::Relaxed),
            is_scanning: settings.is_scanning,
            scan_direction: settings.scan_direction,
            equalizer_mode: settings.equalizer_mode,
            device_volume: settings.device_volume,
            gain_db: settings.gain_db,
            auto_gain: settings.auto_gain,
            running: self.running.load(Ordering::Relaxed),
        }
    }

    fn set_frequency(&self, hz: u64) -> Result<()> {
        if hz == 0 {
            return Err(Error::invalid_argument("frequency must be > 0"));
        }
        let band = {
            let mut settings = self.settings.lock();
            settings.frequency_hz = hz;
            settings.is_scanning = false;
            settings.scan_direction = None;
            settings.band
        };
        self.send(TunerCmd::Tune {
            frequency_hz: hz,
            band,
        });
        self.reset_metadata();
        Ok(())
    }

    fn set_band(&self, band: &str) -> Result<()> {
        let band = Band::parse(band)?;
        let frequency = {
            let mut settings = self.settings.lock();
            settings.band = band;
            settings.frequency_hz = band.default_frequency();
            settings.step_hz = band.default_step();
            settings.is_scanning = false;
            settings.scan_direction = None;
            settings.frequency_hz
        };
        self.send(TunerCmd::Tune {
            frequency_hz: frequency,
            band,
        });
        self.reset_metadata();
        Ok(())
    }

    fn set_step(&self, hz: u64) -> Result<()> {
        if hz == 0 {
            return Err(Error::invalid_argument("step must be > 0"));
        }
        self.settings.lock().step_hz = hz;
        self.publish_radio_state();
        Ok(())
    }

    fn scan_start(&self, direction: ScanDirection) -> Result<()> {
        let step = {
            let mut settings = self.settings.lock();
            settings.is_scanning = true;
            settings.scan_direction = Some(direction);
            settings.step_hz
        };
        self.send(TunerCmd::Scan {
            direction,
            step_hz: step,
        });
        self.publish_radio_state();
        Ok(())
    }

    fn scan_stop(&self) -> Result<()> {
        {
            let mut settings = self.settings.lock();
            settings.is_scanning = false;
            settings.scan_direction = None;
        }
        self.send(TunerCmd::ScanStop);
        self.publish_radio_state();
        Ok(())
    }

    fn set_equalizer_mode(&self, mode: &str) -> Result<()> {
        let lower = mode.to_ascii_lowercase();
        if !EQUALIZER_MODES.contains(&lower.as_str()) {
            return Err(Error::invalid_argument(format!(
                "unknown equalizer mode: {mode}"
            )));
        }
        self.settings.lock().equalizer_mode = lower;
        self.publish_radio_state();
        Ok(())
    }

    fn set_device_volume(&self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(Error::invalid_argument("device volume must be 0-100"));
        }
        self.settings.lock().device_volume = volume;
        self.publish_radio_state();
        Ok(())
    }

    fn set_gain(&self, db: f32) -> Result<()> {
        {
            let mut settings = self.settings.lock();
            settings.gain_db = db;
            settings.auto_gain = false;
        }
        self.send(TunerCmd::SetGain(db));
        self.publish_radio_state();
        Ok(())
    }

    fn set_auto_gain(&self, enabled: bool) -> Result<()> {
        self.settings.lock().auto_gain = enabled;
        self.send(TunerCmd::SetAutoGain(enabled));
        self.publish_radio_state();
        Ok(())
    }
}

/// Display form: "98.5 MHz" for FM-range frequencies, "1000 kHz" below.
pub fn format_frequency(hz: u64, band: Band) -> String {
    match band {
        Band::Am => format!("{} kHz", hz / 1_000),
        _ => format!("{:.1} MHz", hz as f64 / 1_000_000.0),
    }
}

/// Signal strength a scan considers "found a station".
const SCAN_LOCK_THRESHOLD: u8 = 40;

fn tuner_loop(
    mut frontend: Box<dyn SdrFrontend>,
    rx: Receiver<TunerCmd>,
    writer: &mut crate::audio::ring::PcmWriter,
    signal: Arc<AtomicU8>,
    stereo: Arc<AtomicBool>,
    scan_result: Arc<Mutex<Option<u64>>>,
) {
    let mut running = false;
    let mut scanning: Option<(ScanDirection, u64)> = None;
    let mut frequency = 0u64;
    let mut band = Band::Fm;
    let mut last_scan_step = Instant::now();

    loop {
        let cmd = if running {
            rx.try_recv().ok()
        } else {
            rx.recv_timeout(Duration::from_millis(50)).ok()
        };

        match cmd {
            Some(TunerCmd::Tune {
                frequency_hz,
                band: new_band,
            }) => {
                frequency = frequency_hz;
                band = new_band;
                scanning = None;
                if let Err(e) = frontend.tune(frequency, band) {
                    tracing::warn!("tune failed: {e}");
                }
            }
            Some(TunerCmd::SetGain(db)) => {
                if let Err(e) = frontend.set_gain(db) {
                    tracing::warn!("set_gain failed: {e}");
                }
            }
            Some(TunerCmd::SetAutoGain(enabled)) => {
                if let Err(e) = frontend.set_auto_gain(enabled) {
                    tracing::warn!("set_auto_gain failed: {e}");
                }
            }
            Some(TunerCmd::Scan { direction, step_hz }) => {
                scanning = Some((direction, step_hz));
                last_scan_step = Instant::now();
            }
            Some(TunerCmd::ScanStop) => scanning = None,
            Some(TunerCmd::Run(run)) => running = run,
            Some(TunerCmd::Shutdown) => return,
            None => {}
        }

        if let Some((direction, step_hz)) = scanning {
            if last_scan_step.elapsed() >= Duration::from_millis(150) {
                last_scan_step = Instant::now();
                let (low, high) = band.range();
                frequency = match direction {
                    ScanDirection::Up => {
                        let next = frequency + step_hz;
                        if next > high { low } else { next }
                    }
                    ScanDirection::Down => {
                        frequency.checked_sub(step_hz).filter(|f| *f >= low).unwrap_or(high)
                    }
                };
                if let Err(e) = frontend.tune(frequency, band) {
                    tracing::warn!("scan tune failed: {e}");
                }
                let quality = frontend.signal_quality();
                if quality.strength >= SCAN_LOCK_THRESHOLD {
                    tracing::info!(
                        frequency,
                        strength = quality.strength,
                        "scan locked onto a station"
                    );
                    scanning = None;
                    *scan_result.lock() = Some(frequency);
                }
            }
        }

        if running {
            let block = frontend.read_block();
            writer.push(&block);
            let quality = frontend.signal_quality();
            signal.store(quality.strength, Ordering::Relaxed);
            stereo.store(quality.stereo, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn radio() -> SdrRadio {
        SdrRadio::new(
            "radio-1",
            Box::new(OfflineFrontend::new()),
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn test_band_parsing() {
        assert_eq!(Band::parse("fm").unwrap(), Band::Fm);
        assert_eq!(Band::parse("WB").unwrap(), Band::Wb);
        assert_eq!(Band::parse("XX").unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_validation() {
        let r = radio();
        assert_eq!(r.set_frequency(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(r.set_step(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            r.set_device_volume(101).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            r.set_equalizer_mode("metal-ultra").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        r.set_equalizer_mode("Jazz").unwrap();
        assert_eq!(r.radio_state().equalizer_mode, "jazz");
    }

    #[test]
    fn test_band_change_resets_frequency_and_metadata() {
        let r = radio();
        r.set_frequency(101_500_000).unwrap();
        assert_eq!(r.metadata().display_title(), "101.5 MHz");

        r.set_band("AM").unwrap();
        let state = r.radio_state();
        assert_eq!(state.band, Band::Am);
        assert_eq!(state.frequency_hz, Band::Am.default_frequency());
        assert_eq!(state.step_hz, Band::Am.default_step());
        assert_eq!(r.metadata().display_title(), "1000 kHz");
        assert_eq!(r.metadata().display_artist(), "AM Radio");
    }

    #[test]
    fn test_identified_track_overlays_until_retune() {
        let r = radio();
        let mut overlay = TrackMetadata::new();
        overlay.set_text(MetadataKey::Title, "Night Drive");
        overlay.set_text(MetadataKey::Artist, "Some Band");
        r.merge_metadata(overlay);
        assert_eq!(r.metadata().display_title(), "Night Drive");

        r.set_frequency(89_100_000).unwrap();
        assert_eq!(r.metadata().display_title(), "89.1 MHz");
    }

    #[test]
    fn test_scan_locks_station_with_offline_frontend() {
        let r = radio();
        r.initialize().unwrap();
        r.play().unwrap();
        let _feed = r.take_mixer_feed().unwrap();

        r.set_frequency(98_000_000).unwrap();
        r.scan_start(ScanDirection::Up).unwrap();

        // The offline front end reports a station at 98.5 MHz
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = r.radio_state();
            if !state.is_scanning {
                assert_eq!(state.frequency_hz, 98_500_000);
                break;
            }
            assert!(Instant::now() < deadline, "scan never locked");
            std::thread::sleep(Duration::from_millis(20));
        }
        r.dispose().unwrap();
    }

    #[test]
    fn test_scan_stop() {
        let r = radio();
        r.scan_start(ScanDirection::Down).unwrap();
        assert!(r.radio_state().is_scanning);
        r.scan_stop().unwrap();
        let state = r.radio_state();
        assert!(!state.is_scanning);
        assert!(state.scan_direction.is_none());
    }

    #[test]
    fn test_not_seekable() {
        let r = radio();
        assert_eq!(
            r.seek(Duration::from_secs(1)).unwrap_err().kind(),
            ErrorKind::NotSupported
        );
        assert!(r.duration().is_none());
    }
}
