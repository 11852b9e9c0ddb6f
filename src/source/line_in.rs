//! USB line-in capture source (turntable or generic input).
//!
//! Not seekable, no duration, no queue: the producer is a cpal capture
//! stream. The cpal `Stream` handle is not `Send`, so a dedicated owner
//! thread builds and holds it; the capture callback pushes raw samples
//! into an intermediate ring and the owner thread converts them to the
//! bus format between pops.
//!
//! The USB port is reserved against the device manager's table for
//! exactly the lifetime between a successful initialize and dispose.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use crate::audio::ring::{PcmWriter, pcm_ring};
use crate::audio::{Resampler, to_stereo};
use crate::devices::DeviceManager;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::mixer::{BalanceCell, MixerFeed};
use crate::source::{
    AudioSource, Capabilities, MetadataKey, SourceKind, SourceState, StateCell, TrackMetadata,
    VolumeCell,
};

/// Raw capture ring: half a second at worst-case 192kHz stereo.
const CAPTURE_RING: usize = 192_000;

/// Which flavor of line-in this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineInKind {
    Turntable,
    Generic,
}

pub struct UsbLineIn {
    id: String,
    name: String,
    flavor: LineInKind,
    state: Arc<StateCell>,
    volume: Arc<VolumeCell>,
    balance: Arc<BalanceCell>,
    devices: Arc<DeviceManager>,
    port_path: String,
    feed: Mutex<Option<MixerFeed>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    capturing: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    metadata: Mutex<TrackMetadata>,
}

impl UsbLineIn {
    pub fn new(
        id: impl Into<String>,
        flavor: LineInKind,
        usb_port: impl Into<String>,
        devices: Arc<DeviceManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        let id = id.into();
        let name = match flavor {
            LineInKind::Turntable => "Turntable".to_string(),
            LineInKind::Generic => "Line In".to_string(),
        };
        let mut metadata = TrackMetadata::new();
        metadata.set_text(MetadataKey::Title, name.clone());
        metadata.set_text(
            MetadataKey::Source,
            match flavor {
                LineInKind::Turntable => "Vinyl",
                LineInKind::Generic => "UsbLineIn",
            },
        );
        Self {
            name,
            flavor,
            state: Arc::new(StateCell::new(id.clone(), bus)),
            volume: Arc::new(VolumeCell::default()),
            balance: Arc::new(BalanceCell::default()),
            devices,
            port_path: usb_port.into(),
            feed: Mutex::new(None),
            worker: Mutex::new(None),
            capturing: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            metadata: Mutex::new(metadata),
            id,
        }
    }

    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    fn pick_capture_device(&self) -> Result<String> {
        if let Some(device) = self.devices.find_input_by_port(&self.port_path) {
            return Ok(device.id);
        }
        // Fall back to the first available capture device
        match self.devices.list_inputs().first() {
            Some(device) => {
                tracing::warn!(
                    port = %self.port_path,
                    fallback = %device.name,
                    "no capture device matches the reserved port, using fallback"
                );
                Ok(device.id.clone())
            }
            None => Err(Error::external("no capture devices available")),
        }
    }
}

impl AudioSource for UsbLineIn {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        match self.flavor {
            LineInKind::Turntable => SourceKind::Turntable,
            LineInKind::Generic => SourceKind::UsbGeneric,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn state(&self) -> SourceState {
        self.state.get()
    }

    fn initialize(&self) -> Result<()> {
        self.state.transition(SourceState::Initializing, "initialize")?;

        self.devices
            .reservations()
            .reserve(&self.port_path, &self.id)
            .inspect_err(|e| self.state.fail(e))?;

        let device_id = match self.pick_capture_device() {
            Ok(id) => id,
            Err(e) => {
                self.devices.reservations().release(&self.port_path);
                self.state.fail(&e);
                return Err(e);
            }
        };

        let (writer, reader) = pcm_ring(CAPTURE_RING);
        *self.feed.lock() = Some(MixerFeed {
            source_id: self.id.clone(),
            reader,
            volume: Arc::clone(&self.volume),
            balance: Arc::clone(&self.balance),
            duck_exempt: false,
            is_event: false,
        });

        self.cancelled.store(false, Ordering::Release);
        let capturing = Arc::clone(&self.capturing);
        let cancelled = Arc::clone(&self.cancelled);
        let state = Arc::clone(&self.state);
        let handle = std::thread::Builder::new()
            .name(format!("line-in-{}", self.id))
            .spawn(move || capture_loop(device_id, writer, capturing, cancelled, state))
            .map_err(|e| Error::external(e.to_string()))?;
        *self.worker.lock() = Some(handle);

        self.state.transition(SourceState::Ready, "initialize")?;
        Ok(())
    }

    fn play(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "play")?;
        self.capturing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.state.transition(SourceState::Paused, "pause")?;
        self.capturing.store(false, Ordering::Release);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "resume")?;
        self.capturing.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.state.transition(SourceState::Stopped, "stop")?;
        self.capturing.store(false, Ordering::Release);
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
        self.devices.reservations().release(&self.port_path);
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        None
    }

    fn metadata(&self) -> TrackMetadata {
        let mut meta = self.metadata.lock().clone();
        meta.set_text(MetadataKey::Device, self.port_path.clone());
        meta
    }

    fn merge_metadata(&self, overlay: TrackMetadata) {
        let mut metadata = self.metadata.lock();
        for (key, value) in overlay.iter() {
            metadata.set(*key, value.clone());
        }
        drop(metadata);
        self.state.bus().publish(crate::events::EngineEvent::MetadataChanged {
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
}

/// One capture attempt: device lookup, config and stream build. The raw
/// ring lives inside the cpal callback; its reader comes back out.
fn open_capture(
    device_id: &str,
) -> crate::error::Result<(cpal::Stream, crate::audio::ring::PcmReader, u32, u16)> {
    let host = cpal::default_host();
    let device = host
        .input_devices()
        .map_err(|e| Error::external(e.to_string()))?
        .find(|d| d.name().ok().as_deref() == Some(device_id))
        .ok_or_else(|| Error::external(format!("capture device {device_id} disappeared")))?;

    let config = device
        .default_input_config()
        .map_err(|e| Error::external(format!("no default input config: {e}")))?;
    let rate = config.sample_rate().0;
    let channels = config.channels();

    let (mut raw_writer, raw_reader) = pcm_ring(CAPTURE_RING);
    let stream_config: cpal::StreamConfig = config.config();

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                raw_writer.push(data);
            },
            |e| tracing::warn!("capture stream error: {e}"),
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(256) {
                    let floats: Vec<f32> =
                        chunk.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                    raw_writer.push(&floats);
                }
            },
            |e| tracing::warn!("capture stream error: {e}"),
            None,
        ),
        format => {
            return Err(Error::external(format!("unsupported capture format: {format:?}")));
        }
    };
    let stream = stream.map_err(|e| Error::external(format!("build capture stream: {e}")))?;
    stream
        .play()
        .map_err(|e| Error::external(format!("start capture stream: {e}")))?;
    tracing::info!(device = device_id, rate, channels, "capture stream running");
    Ok((stream, raw_reader, rate, channels))
}

/// Capture attempts before giving up and failing the source.
const MAX_OPEN_ATTEMPTS: u32 = 5;

/// Owner thread: opens the capture stream (retrying transient device
/// failures with exponential backoff), converts raw capture audio to the
/// bus format and feeds the mixer while capturing is enabled.
fn capture_loop(
    device_id: String,
    mut writer: PcmWriter,
    capturing: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    state: Arc<StateCell>,
) {
    let mut attempt = 0u32;
    let (stream, mut raw_reader, rate, channels) = loop {
        if cancelled.load(Ordering::Acquire) {
            return;
        }
        match open_capture(&device_id) {
            Ok(parts) => break parts,
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_OPEN_ATTEMPTS {
                    state.fail(&e);
                    return;
                }
                let backoff = Duration::from_millis(200 << attempt.min(5));
                tracing::warn!(
                    attempt,
                    "capture open failed: {e}; retrying in {backoff:?}"
                );
                // Sleep in short steps so cancellation stays responsive
                let deadline = std::time::Instant::now() + backoff;
                while std::time::Instant::now() < deadline {
                    if cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    };

    let mut resampler = Resampler::to_bus_rate(rate, 2);
    let mut raw = vec![0.0f32; 4096];
    let mut stereo = Vec::new();

    while !cancelled.load(Ordering::Acquire) {
        let read = raw_reader.pop(&mut raw);
        if read == 0 {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        if !capturing.load(Ordering::Acquire) {
            // Paused/stopped: discard captured audio
            continue;
        }
        to_stereo(&raw[..read], channels as usize, &mut stereo);
        let converted = resampler.process(&stereo);
        let mut offset = 0;
        while offset < converted.len() {
            let written = writer.push(&converted[offset..]);
            offset += written;
            if written == 0 {
                break; // mixer is behind; drop the remainder
            }
        }
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_in(devices: Arc<DeviceManager>, port: &str) -> UsbLineIn {
        UsbLineIn::new(
            "vinyl-1",
            LineInKind::Turntable,
            port,
            devices,
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn test_not_seekable_no_duration_no_queue() {
        let devices = Arc::new(DeviceManager::new());
        let source = line_in(devices, "usb:test-port");
        assert!(source.seek(Duration::ZERO).is_err());
        assert!(source.duration().is_none());
        assert!(source.queue_snapshot().is_err());
        assert!(source.capabilities().is_empty());
    }

    #[test]
    fn test_port_reserved_only_while_live() {
        let devices = Arc::new(DeviceManager::new());
        let source = line_in(Arc::clone(&devices), "usb:deck");

        match source.initialize() {
            Ok(()) => {
                // Ready: port must be held by this source
                assert_eq!(
                    devices.reservations().owner("usb:deck").as_deref(),
                    Some("vinyl-1")
                );
                source.dispose().unwrap();
                assert!(!devices.reservations().is_in_use("usb:deck"));
            }
            Err(_) => {
                // No capture hardware here: the reservation must have
                // been rolled back
                assert!(!devices.reservations().is_in_use("usb:deck"));
            }
        }
    }

    #[test]
    fn test_port_conflict_between_sources() {
        let devices = Arc::new(DeviceManager::new());
        devices.reservations().reserve("usb:deck", "someone-else").unwrap();

        let source = line_in(Arc::clone(&devices), "usb:deck");
        let err = source.initialize().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert_eq!(source.state(), SourceState::Error);
        // Still held by the original owner
        assert_eq!(
            devices.reservations().owner("usb:deck").as_deref(),
            Some("someone-else")
        );
    }
}
