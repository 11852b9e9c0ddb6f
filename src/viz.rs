//! Visualization pipeline: spectrum, levels and waveform analyses over
//! the mixed bus.
//!
//! A dedicated consumer tap feeds the [`Analyzer`], which keeps rolling
//! windows and produces three snapshot kinds. The service thread runs the
//! analyzer at a fixed cadence (50 Hz tap drain, 25 Hz publish) and
//! publishes through an `ArcSwap` for pull-style reads plus a broadcast
//! channel for the push hub.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use crate::audio::BUS_SAMPLE_RATE;
use crate::audio::ring::PcmReader;
use crate::config::VisualizerConfig;
use crate::mixer::{Mixer, MixerShared};

/// Floor used when converting linear levels to dBFS.
const DB_FLOOR: f32 = -120.0;

/// Any sample at or above this counts as clipping.
const CLIP_THRESHOLD: f32 = 0.99;

/// Linear peak-hold decay: full scale falls to zero in this long.
const PEAK_DECAY: Duration = Duration::from_millis(1500);

/// Spectrum snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpectrumSnapshot {
    pub magnitudes: Vec<f32>,
    pub frequencies: Vec<f32>,
    pub bin_count: usize,
    pub frequency_resolution: f32,
    pub max_frequency: f32,
    pub timestamp_ms: i64,
}

/// Per-channel level measurements.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ChannelLevels {
    pub peak: f32,
    pub rms: f32,
    pub peak_db: f32,
    pub rms_db: f32,
    /// Peak with hold-then-decay applied
    pub peak_hold: f32,
}

/// Levels snapshot.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LevelsSnapshot {
    pub left: ChannelLevels,
    pub right: ChannelLevels,
    pub is_clipping: bool,
    pub timestamp_ms: i64,
}

/// Waveform snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WaveformSnapshot {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub sample_count: usize,
    pub window_ms: u32,
    pub timestamp_ms: i64,
}

/// Updates fanned out to push-hub subscribers.
#[derive(Debug, Clone)]
pub enum VizUpdate {
    Spectrum(Arc<SpectrumSnapshot>),
    Levels(LevelsSnapshot),
    Waveform(Arc<WaveformSnapshot>),
}

/// Linear value to dBFS, clamped to [DB_FLOOR, 0].
#[inline]
pub fn to_dbfs(linear: f32) -> f32 {
    if linear <= 0.0 {
        DB_FLOOR
    } else {
        (20.0 * linear.log10()).clamp(DB_FLOOR, 0.0)
    }
}

/// The DSP core, synchronous and self-contained so analyses are testable
/// without the service thread.
pub struct Analyzer {
    config: VisualizerConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    fft_input: Vec<f32>,
    fft_output: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    /// Rolling mono window for the FFT (fft_size frames)
    mono: VecDeque<f32>,
    /// Rolling per-channel windows for levels/waveform
    left: VecDeque<f32>,
    right: VecDeque<f32>,
    /// Frames covered by the waveform window
    window_frames: usize,
    /// Per-bin smoothed magnitudes
    smoothed: Vec<f32>,
    /// Running normalization peak
    running_peak: f32,
    /// Peak-hold state per channel: (held value, held at ms)
    hold_left: (f32, i64),
    hold_right: (f32, i64),
}

impl Analyzer {
    pub fn new(config: VisualizerConfig) -> Self {
        let fft_size = config.fft_size;
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        // Hann window for reduced spectral leakage
        let window: Vec<f32> = (0..fft_size)
            .map(|i| {
                let x = std::f32::consts::PI * 2.0 * i as f32 / (fft_size - 1) as f32;
                0.5 * (1.0 - x.cos())
            })
            .collect();

        // Waveform spans ~50ms by default, stretched so the configured
        // sample count never oversamples the window
        let window_frames = (BUS_SAMPLE_RATE as usize / 20).max(config.waveform_sample_count);

        Self {
            fft,
            window,
            fft_input: vec![0.0; fft_size],
            fft_output: vec![Complex::new(0.0, 0.0); fft_size / 2 + 1],
            fft_scratch: vec![Complex::new(0.0, 0.0); fft_size],
            mono: VecDeque::with_capacity(fft_size),
            left: VecDeque::with_capacity(window_frames),
            right: VecDeque::with_capacity(window_frames),
            window_frames,
            smoothed: vec![0.0; fft_size / 2],
            running_peak: 1e-6,
            hold_left: (0.0, 0),
            hold_right: (0.0, 0),
            config,
        }
    }

    /// Feed interleaved stereo bus samples.
    pub fn ingest(&mut self, samples: &[f32]) {
        for frame in samples.chunks_exact(2) {
            let (l, r) = (frame[0], frame[1]);
            if self.mono.len() == self.config.fft_size {
                self.mono.pop_front();
            }
            self.mono.push_back((l + r) * 0.5);
            if self.left.len() == self.window_frames {
                self.left.pop_front();
                self.right.pop_front();
            }
            self.left.push_back(l);
            self.right.push_back(r);
        }
    }

    /// Windowed FFT over the most recent fft_size frames.
    pub fn spectrum(&mut self, timestamp_ms: i64) -> SpectrumSnapshot {
        let fft_size = self.config.fft_size;
        let bins = fft_size / 2;

        for (i, slot) in self.fft_input.iter_mut().enumerate() {
            let sample = self.mono.get(i).copied().unwrap_or(0.0);
            *slot = if self.config.apply_window {
                sample * self.window[i]
            } else {
                sample
            };
        }

        if self
            .fft
            .process_with_scratch(&mut self.fft_input, &mut self.fft_output, &mut self.fft_scratch)
            .is_err()
        {
            tracing::warn!("fft failed; returning previous spectrum");
        }

        // Normalize by a slowly-decaying running peak, then smooth per bin
        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        let mut frame_peak = 0.0f32;
        for bin in &self.fft_output[..bins] {
            frame_peak = frame_peak.max(bin.norm());
        }
        self.running_peak = (self.running_peak * 0.995).max(frame_peak).max(1e-6);

        for (i, slot) in self.smoothed.iter_mut().enumerate() {
            let normalized = (self.fft_output[i].norm() / self.running_peak).min(1.0);
            *slot = alpha * *slot + (1.0 - alpha) * normalized;
        }

        let resolution = BUS_SAMPLE_RATE as f32 / fft_size as f32;
        SpectrumSnapshot {
            magnitudes: self.smoothed.clone(),
            frequencies: (0..bins).map(|i| i as f32 * resolution).collect(),
            bin_count: bins,
            frequency_resolution: resolution,
            max_frequency: BUS_SAMPLE_RATE as f32 / 2.0,
            timestamp_ms,
        }
    }

    /// Peak/RMS per channel over the rolling window.
    pub fn levels(&mut self, timestamp_ms: i64) -> LevelsSnapshot {
        let mut clipping = false;
        let left = Self::measure(&self.left, &mut clipping);
        let right = Self::measure(&self.right, &mut clipping);

        let hold_ms = self.config.peak_hold_time_ms as i64;
        let left_hold = Self::apply_hold(&mut self.hold_left, left.0, timestamp_ms, hold_ms);
        let right_hold = Self::apply_hold(&mut self.hold_right, right.0, timestamp_ms, hold_ms);

        LevelsSnapshot {
            left: ChannelLevels {
                peak: left.0,
                rms: left.1,
                peak_db: to_dbfs(left.0),
                rms_db: to_dbfs(left.1),
                peak_hold: left_hold,
            },
            right: ChannelLevels {
                peak: right.0,
                rms: right.1,
                peak_db: to_dbfs(right.0),
                rms_db: to_dbfs(right.1),
                peak_hold: right_hold,
            },
            is_clipping: clipping,
            timestamp_ms,
        }
    }

    fn measure(samples: &VecDeque<f32>, clipping: &mut bool) -> (f32, f32) {
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        let mut peak = 0.0f32;
        let mut sum_sq = 0.0f64;
        for &s in samples {
            let a = s.abs();
            peak = peak.max(a);
            sum_sq += (s as f64) * (s as f64);
            if a >= CLIP_THRESHOLD {
                *clipping = true;
            }
        }
        let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
        (peak.min(1.0), rms.min(1.0))
    }

    /// Hold the peak for the configured window, then decay linearly.
    fn apply_hold(hold: &mut (f32, i64), current: f32, now_ms: i64, hold_ms: i64) -> f32 {
        if current >= hold.0 {
            *hold = (current, now_ms);
            return current;
        }
        let age = now_ms - hold.1;
        if age <= hold_ms {
            return hold.0;
        }
        let decay_ms = PEAK_DECAY.as_millis() as i64;
        let decayed = hold.0 - (age - hold_ms) as f32 / decay_ms as f32;
        let value = decayed.max(current).max(0.0);
        if value <= current {
            *hold = (current, now_ms);
        }
        value
    }

    /// Downsampled per-channel time-domain arrays.
    pub fn waveform(&self, timestamp_ms: i64) -> WaveformSnapshot {
        let count = self.config.waveform_sample_count.max(1);
        let pick = |samples: &VecDeque<f32>| -> Vec<f32> {
            if samples.is_empty() {
                return vec![0.0; count];
            }
            (0..count)
                .map(|i| {
                    let index = i * samples.len() / count;
                    samples.get(index).copied().unwrap_or(0.0).clamp(-1.0, 1.0)
                })
                .collect()
        };
        WaveformSnapshot {
            left: pick(&self.left),
            right: pick(&self.right),
            sample_count: count,
            window_ms: (self.window_frames * 1000 / BUS_SAMPLE_RATE as usize) as u32,
            timestamp_ms,
        }
    }
}

/// The visualization service: tap + analyzer + publication.
pub struct VisualizationService {
    spectrum: Arc<ArcSwap<SpectrumSnapshot>>,
    levels: Arc<ArcSwap<LevelsSnapshot>>,
    waveform: Arc<ArcSwap<WaveformSnapshot>>,
    updates: tokio::sync::broadcast::Sender<VizUpdate>,
    mixer_shared: Arc<MixerShared>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl VisualizationService {
    const TAP_ID: &'static str = "viz";

    /// Spawn the service, subscribing a tap on the mixer.
    pub fn spawn(config: VisualizerConfig, mixer: &Mixer) -> Self {
        let (writer, reader) = crate::audio::ring::pcm_ring(BUS_SAMPLE_RATE as usize / 2);
        mixer.add_pcm_tap(Self::TAP_ID, writer);

        let now = chrono::Utc::now().timestamp_millis();
        let mut analyzer = Analyzer::new(config);
        let spectrum = Arc::new(ArcSwap::from_pointee(analyzer.spectrum(now)));
        let levels = Arc::new(ArcSwap::from_pointee(analyzer.levels(now)));
        let waveform = Arc::new(ArcSwap::from_pointee(analyzer.waveform(now)));
        let (updates, _) = tokio::sync::broadcast::channel(64);

        let cancel = Arc::new(AtomicBool::new(false));
        let thread = {
            let spectrum = Arc::clone(&spectrum);
            let levels = Arc::clone(&levels);
            let waveform = Arc::clone(&waveform);
            let updates = updates.clone();
            let cancel = Arc::clone(&cancel);
            std::thread::Builder::new()
                .name("viz".to_string())
                .spawn(move || {
                    analysis_loop(analyzer, reader, spectrum, levels, waveform, updates, cancel)
                })
                .expect("failed to spawn viz thread")
        };

        Self {
            spectrum,
            levels,
            waveform,
            updates,
            mixer_shared: Arc::clone(mixer.shared()),
            cancel,
            thread: Some(thread),
        }
    }

    pub fn spectrum(&self) -> Arc<SpectrumSnapshot> {
        self.spectrum.load_full()
    }

    pub fn levels(&self) -> Arc<LevelsSnapshot> {
        self.levels.load_full()
    }

    pub fn waveform(&self) -> Arc<WaveformSnapshot> {
        self.waveform.load_full()
    }

    /// True while the mixer carries non-silent output.
    pub fn is_active(&self) -> bool {
        self.mixer_shared.is_active()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<VizUpdate> {
        self.updates.subscribe()
    }
}

impl Drop for VisualizationService {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn analysis_loop(
    mut analyzer: Analyzer,
    mut reader: PcmReader,
    spectrum: Arc<ArcSwap<SpectrumSnapshot>>,
    levels: Arc<ArcSwap<LevelsSnapshot>>,
    waveform: Arc<ArcSwap<WaveformSnapshot>>,
    updates: tokio::sync::broadcast::Sender<VizUpdate>,
    cancel: Arc<AtomicBool>,
) {
    let mut scratch = vec![0.0f32; 9600];
    let mut last_publish = std::time::Instant::now();

    while !cancel.load(Ordering::Acquire) {
        let read = reader.pop(&mut scratch);
        if read > 0 {
            analyzer.ingest(&scratch[..read]);
        }

        // Publish at 25 Hz regardless of tap burstiness
        if last_publish.elapsed() >= Duration::from_millis(40) {
            last_publish = std::time::Instant::now();
            let now = chrono::Utc::now().timestamp_millis();

            let s = Arc::new(analyzer.spectrum(now));
            let l = analyzer.levels(now);
            let w = Arc::new(analyzer.waveform(now));

            spectrum.store(Arc::clone(&s));
            levels.store(Arc::new(l));
            waveform.store(Arc::clone(&w));

            let _ = updates.send(VizUpdate::Spectrum(s));
            let _ = updates.send(VizUpdate::Levels(l));
            let _ = updates.send(VizUpdate::Waveform(w));
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fft_size: usize) -> VisualizerConfig {
        VisualizerConfig {
            fft_size,
            waveform_sample_count: 512,
            peak_hold_time_ms: 100,
            apply_window: true,
            smoothing: 0.0,
        }
    }

    fn sine(frequency: f32, frames: usize) -> Vec<f32> {
        let mut samples = Vec::with_capacity(frames * 2);
        for n in 0..frames {
            let t = n as f32 / BUS_SAMPLE_RATE as f32;
            let v = (2.0 * std::f32::consts::PI * frequency * t).sin();
            samples.push(v);
            samples.push(v);
        }
        samples
    }

    #[test]
    fn test_sine_peak_bin() {
        let fft_size = 2048;
        let mut analyzer = Analyzer::new(config(fft_size));
        let frequency = 3000.0;
        analyzer.ingest(&sine(frequency, fft_size * 2));

        let snapshot = analyzer.spectrum(0);
        let expected_bin =
            (frequency * fft_size as f32 / BUS_SAMPLE_RATE as f32).round() as usize;

        let (peak_bin, peak_mag) = snapshot
            .magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(peak_bin, expected_bin);
        for (i, &mag) in snapshot.magnitudes.iter().enumerate() {
            if i != peak_bin {
                assert!(mag < *peak_mag, "bin {i} not below the peak");
            }
        }
        assert_eq!(snapshot.bin_count, fft_size / 2);
        assert!((snapshot.frequency_resolution - 23.4375).abs() < 0.01);
        assert_eq!(snapshot.max_frequency, 24_000.0);
    }

    #[test]
    fn test_constant_signal_levels() {
        let mut analyzer = Analyzer::new(config(1024));
        let a = 0.5f32;
        let samples: Vec<f32> = std::iter::repeat_n(a, 9600).collect();
        analyzer.ingest(&samples);

        let levels = analyzer.levels(0);
        assert!((levels.left.peak - a).abs() < 1e-4);
        assert!((levels.left.rms - a).abs() < 1e-3);
        assert!((levels.right.peak - a).abs() < 1e-4);
        assert!(!levels.is_clipping);
        assert!((levels.left.peak_db - 20.0 * a.log10()).abs() < 0.01);
    }

    #[test]
    fn test_silence_levels() {
        let mut analyzer = Analyzer::new(config(1024));
        analyzer.ingest(&vec![0.0f32; 4096]);
        let levels = analyzer.levels(0);
        assert_eq!(levels.left.peak, 0.0);
        assert_eq!(levels.left.rms, 0.0);
        assert!(!levels.is_clipping);
        assert_eq!(levels.left.peak_db, DB_FLOOR);
    }

    #[test]
    fn test_clipping_detection() {
        let mut analyzer = Analyzer::new(config(1024));
        let mut samples = vec![0.1f32; 512];
        samples[100] = 0.995;
        analyzer.ingest(&samples);
        assert!(analyzer.levels(0).is_clipping);
    }

    #[test]
    fn test_peak_hold_then_decay() {
        let mut analyzer = Analyzer::new(config(1024));
        analyzer.ingest(&vec![0.8f32; 1024]);
        let initial = analyzer.levels(0);
        assert!((initial.left.peak_hold - 0.8).abs() < 1e-4);

        // Signal drops; the hold keeps the old peak inside the window
        analyzer.ingest(&vec![0.1f32; 200_000]);
        let held = analyzer.levels(50);
        assert!((held.left.peak_hold - 0.8).abs() < 1e-4);

        // After the hold window it decays monotonically toward current
        let decayed_a = analyzer.levels(400).left.peak_hold;
        let decayed_b = analyzer.levels(800).left.peak_hold;
        assert!(decayed_a < 0.8);
        assert!(decayed_b <= decayed_a);
        assert!(decayed_b >= 0.1 - 1e-4);
    }

    #[test]
    fn test_waveform_shape() {
        let mut analyzer = Analyzer::new(config(1024));
        analyzer.ingest(&sine(440.0, 4800));
        let w = analyzer.waveform(0);
        assert_eq!(w.left.len(), 512);
        assert_eq!(w.right.len(), 512);
        assert!(w.left.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert!(w.left.iter().any(|s| s.abs() > 0.5));
    }
}
