//! Local device playback output.
//!
//! Subscribes a real-time tap on the mixer fan-out and drains it from the
//! cpal output callback. The cpal `Stream` is not `Send`, so an owner
//! thread builds and holds it; the same thread watches the device
//! manager's output generation and rebuilds the stream when the active
//! device changes, which keeps the swap within a single callback frame.
//!
//! # Real-time Safety
//!
//! The cpal callback uses only atomics (volume/mute) and the lock-free
//! tap ring. Underruns fill with silence and are counted, never blocked on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use parking_lot::Mutex;

use crate::audio::ring::{PcmReader, pcm_ring};
use crate::audio::{BUS_CHANNELS, BUS_SAMPLE_RATE, SAMPLES_PER_TICK};
use crate::devices::DeviceManager;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::mixer::Mixer;
use crate::outputs::{Output, OutputState, OutputStateCell};
use crate::source::VolumeCell;

/// Tap depth: a quarter second of bus audio absorbs scheduling jitter.
const TAP_CAPACITY: usize = SAMPLES_PER_TICK * 25;

pub struct LocalOutput {
    id: String,
    state: OutputStateCell,
    mixer: Arc<Mixer>,
    devices: Arc<DeviceManager>,
    volume: Arc<VolumeCell>,
    muted: Arc<AtomicBool>,
    underruns: Arc<AtomicU32>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LocalOutput {
    pub fn new(mixer: Arc<Mixer>, devices: Arc<DeviceManager>, bus: Arc<EventBus>) -> Self {
        Self {
            id: "output-local".to_string(),
            state: OutputStateCell::new("output-local", bus),
            mixer,
            devices,
            volume: Arc::new(VolumeCell::default()),
            muted: Arc::new(AtomicBool::new(false)),
            underruns: Arc::new(AtomicU32::new(0)),
            worker: Mutex::new(None),
        }
    }

    pub fn underruns(&self) -> u32 {
        self.underruns.load(Ordering::Relaxed)
    }

    fn teardown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.cancel.store(true, Ordering::Release);
            let _ = worker.handle.join();
        }
        self.mixer.remove_pcm_tap(&self.id);
    }
}

impl Output for LocalOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Local Playback"
    }

    fn state(&self) -> OutputState {
        self.state.get()
    }

    fn initialize(&self) -> Result<()> {
        self.state.transition(OutputState::Initializing, "initialize")?;
        self.state.transition(OutputState::Ready, "initialize")?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.state.transition(OutputState::Streaming, "start")?;

        let (writer, reader) = pcm_ring(TAP_CAPACITY);
        self.mixer.add_pcm_tap(&self.id, writer);

        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);
        let devices = Arc::clone(&self.devices);
        let volume = Arc::clone(&self.volume);
        let muted = Arc::clone(&self.muted);
        let underruns = Arc::clone(&self.underruns);
        let output_id = self.id.clone();
        let handle = std::thread::Builder::new()
            .name("local-output".to_string())
            .spawn(move || {
                playback_loop(devices, reader, volume, muted, underruns, worker_cancel, output_id)
            })
            .map_err(|e| Error::external(e.to_string()))?;

        *self.worker.lock() = Some(Worker { cancel, handle });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.state.get() != OutputState::Streaming {
            tracing::warn!("local output stop requested while not streaming");
            return Ok(());
        }
        self.state.transition(OutputState::Stopping, "stop")?;
        self.teardown();
        self.state.transition(OutputState::Stopped, "stop")?;
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if !self.state.dispose() {
            return Ok(());
        }
        self.teardown();
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.volume.get()
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::invalid_argument("volume must be in [0,1]"));
        }
        self.volume.set(volume);
        Ok(())
    }

    fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    fn set_muted(&self, muted: bool) -> Result<()> {
        self.muted.store(muted, Ordering::Relaxed);
        Ok(())
    }
}

/// Owner thread: builds the output stream against the active device and
/// rebuilds whenever the device selection generation moves.
fn playback_loop(
    devices: Arc<DeviceManager>,
    reader: PcmReader,
    volume: Arc<VolumeCell>,
    muted: Arc<AtomicBool>,
    underruns: Arc<AtomicU32>,
    cancel: Arc<AtomicBool>,
    output_id: String,
) {
    // The tap reader outlives individual streams: each rebuilt callback
    // shares it through a try_lock (uncontended outside rebuilds).
    let shared_reader = Arc::new(Mutex::new(reader));

    let mut generation = devices.output_generation();
    let mut stream = build_stream(
        &devices,
        &shared_reader,
        &volume,
        &muted,
        &underruns,
    );
    if stream.is_none() {
        tracing::error!(output = %output_id, "no playable output device");
    }

    while !cancel.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
        let current = devices.output_generation();
        if current != generation {
            generation = current;
            tracing::info!(output = %output_id, "rebuilding stream for new device");
            drop(stream.take());
            stream = build_stream(&devices, &shared_reader, &volume, &muted, &underruns);
        }
    }
    drop(stream);
}

type SharedReader = Arc<Mutex<PcmReader>>;

fn build_stream(
    devices: &Arc<DeviceManager>,
    shared_reader: &SharedReader,
    volume: &Arc<VolumeCell>,
    muted: &Arc<AtomicBool>,
    underruns: &Arc<AtomicU32>,
) -> Option<cpal::Stream> {
    let host = cpal::default_host();
    let wanted = devices.active_output().map(|d| d.id);
    let device = match &wanted {
        Some(id) => host
            .output_devices()
            .ok()
            .and_then(|mut all| all.find(|d| d.name().ok().as_deref() == Some(id.as_str())))
            .or_else(|| host.default_output_device()),
        None => host.default_output_device(),
    }?;

    let supported = device.default_output_config().ok()?;
    let config = StreamConfig {
        channels: BUS_CHANNELS,
        sample_rate: cpal::SampleRate(BUS_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let reader = Arc::clone(shared_reader);
    let volume = Arc::clone(volume);
    let muted = Arc::clone(muted);
    let underruns = Arc::clone(underruns);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let gain = if muted.load(Ordering::Relaxed) {
                    0.0
                } else {
                    volume.get()
                };
                // try_lock: only ever contended for a moment during a
                // device rebuild; silence is the right fallback
                let read = match reader.try_lock() {
                    Some(mut tap) => tap.pop(data),
                    None => 0,
                };
                for sample in data[..read].iter_mut() {
                    *sample *= gain;
                }
                if read < data.len() {
                    data[read..].fill(0.0);
                    underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            |e| tracing::warn!("output stream error: {e}"),
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch = vec![0.0f32; 4096];
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let gain = if muted.load(Ordering::Relaxed) {
                        0.0
                    } else {
                        volume.get()
                    };
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0.0);
                    }
                    let read = match reader.try_lock() {
                        Some(mut tap) => tap.pop(&mut scratch[..data.len()]),
                        None => 0,
                    };
                    for (out, sample) in data.iter_mut().zip(scratch.iter()).take(read) {
                        *out = (sample * gain * i16::MAX as f32) as i16;
                    }
                    if read < data.len() {
                        for out in data[read..].iter_mut() {
                            *out = 0;
                        }
                        underruns.fetch_add(1, Ordering::Relaxed);
                    }
                },
                |e| tracing::warn!("output stream error: {e}"),
                None,
            )
        }
        format => {
            tracing::error!("unsupported output sample format: {format:?}");
            return None;
        }
    };

    match stream {
        Ok(stream) => match stream.play() {
            Ok(()) => Some(stream),
            Err(e) => {
                tracing::error!("failed to start output stream: {e}");
                None
            }
        },
        Err(e) => {
            tracing::error!("failed to build output stream: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::ducking::DuckingEngine;

    fn output() -> LocalOutput {
        let (mixer, _notices) = Mixer::spawn(Arc::new(DuckingEngine::default()));
        LocalOutput::new(
            Arc::new(mixer),
            Arc::new(DeviceManager::new()),
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn test_stop_when_not_streaming_warns_and_succeeds() {
        let out = output();
        out.initialize().unwrap();
        out.stop().unwrap();
        assert_eq!(out.state(), OutputState::Ready);
    }

    #[test]
    fn test_volume_validation() {
        let out = output();
        assert!(out.set_volume(1.5).is_err());
        out.set_volume(0.3).unwrap();
        assert!((out.volume() - 0.3).abs() < 1e-4);
    }

    #[test]
    fn test_lifecycle() {
        let out = output();
        out.initialize().unwrap();
        assert_eq!(out.state(), OutputState::Ready);
        // start may fail on machines without audio; state still moves
        // through the machine on the happy path
        if out.start().is_ok() {
            assert_eq!(out.state(), OutputState::Streaming);
            out.stop().unwrap();
            assert_eq!(out.state(), OutputState::Stopped);
        }
        out.dispose().unwrap();
        assert_eq!(out.state(), OutputState::Disposed);
    }
}
