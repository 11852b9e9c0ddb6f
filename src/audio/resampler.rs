//! Source-edge resampler using rubato.
//!
//! Every producer that does not already run at the 48 kHz bus rate goes
//! through one of these on its way into the mix graph, so the mixer only
//! ever sees the canonical format.

use rubato::{FftFixedIn, Resampler as RubatoResampler};

use super::BUS_SAMPLE_RATE;

/// Interleaved-in, interleaved-out resampler to the bus rate.
pub struct Resampler {
    inner: Option<FftFixedIn<f32>>,
    input_rate: u32,
    channels: usize,
    /// Per-channel accumulation buffers
    pending: Vec<Vec<f32>>,
    /// Samples per channel required for one rubato call
    chunk_size: usize,
}

impl Resampler {
    /// Create a resampler from `input_rate` to the bus rate.
    ///
    /// A matching input rate turns this into a pass-through.
    pub fn to_bus_rate(input_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1) as usize;

        if input_rate == BUS_SAMPLE_RATE {
            return Self {
                inner: None,
                input_rate,
                channels,
                pending: vec![Vec::new(); channels],
                chunk_size: 0,
            };
        }

        // Larger chunks are more efficient but add latency at the source edge
        let chunk_size = 1024;

        let inner = FftFixedIn::<f32>::new(
            input_rate as usize,
            BUS_SAMPLE_RATE as usize,
            chunk_size,
            2,
            channels,
        )
        .expect("resampler construction with fixed chunk size cannot fail");

        tracing::debug!(
            "Resampling source edge: {}Hz -> {}Hz ({} channels)",
            input_rate,
            BUS_SAMPLE_RATE,
            channels
        );

        Self {
            inner: Some(inner),
            input_rate,
            channels,
            pending: vec![Vec::new(); channels],
            chunk_size,
        }
    }

    /// Whether any conversion happens.
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Output/input rate ratio.
    pub fn ratio(&self) -> f64 {
        BUS_SAMPLE_RATE as f64 / self.input_rate as f64
    }

    /// Feed interleaved samples, returning resampled interleaved output.
    ///
    /// Output is produced in whole chunks; short inputs accumulate until a
    /// chunk fills.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(ref mut inner) = self.inner else {
            return input.to_vec();
        };

        for (i, sample) in input.iter().enumerate() {
            self.pending[i % self.channels].push(*sample);
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= self.chunk_size {
            let chunks: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|buf| buf.drain(..self.chunk_size).collect())
                .collect();

            match inner.process(&chunks, None) {
                Ok(resampled) => interleave_into(&resampled, &mut output),
                Err(e) => tracing::warn!("Resampling error: {}", e),
            }
        }

        output
    }

    /// Flush remaining buffered samples, zero-padding the final chunk.
    pub fn flush(&mut self) -> Vec<f32> {
        let remaining = self.pending[0].len();
        let Some(ref mut inner) = self.inner else {
            return Vec::new();
        };
        if remaining == 0 {
            return Vec::new();
        }

        let pad = self.chunk_size - remaining;
        for buf in &mut self.pending {
            buf.extend(std::iter::repeat_n(0.0, pad));
        }
        let chunks: Vec<Vec<f32>> = self.pending.drain(..).collect();
        self.pending = vec![Vec::new(); self.channels];

        let ratio = BUS_SAMPLE_RATE as f64 / self.input_rate as f64;
        let mut output = Vec::new();
        match inner.process(&chunks, None) {
            Ok(resampled) => {
                let expected = (remaining as f64 * ratio).ceil() as usize;
                interleave_limited(&resampled, expected, &mut output);
            }
            Err(e) => tracing::warn!("Resampling flush error: {}", e),
        }
        output
    }

    /// Drop buffered input (call after seek).
    pub fn reset(&mut self) {
        for buf in &mut self.pending {
            buf.clear();
        }
        if let Some(ref mut inner) = self.inner {
            inner.reset();
        }
    }
}

fn interleave_into(channels: &[Vec<f32>], out: &mut Vec<f32>) {
    if channels.is_empty() || channels[0].is_empty() {
        return;
    }
    interleave_limited(channels, channels[0].len(), out);
}

fn interleave_limited(channels: &[Vec<f32>], max_frames: usize, out: &mut Vec<f32>) {
    if channels.is_empty() {
        return;
    }
    let frames = channels[0].len().min(max_frames);
    for frame in 0..frames {
        for ch in channels {
            out.push(ch[frame]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut r = Resampler::to_bus_rate(48_000, 2);
        assert!(r.is_passthrough());
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(r.process(&input), input);
    }

    #[test]
    fn test_conversion_when_rates_differ() {
        let r = Resampler::to_bus_rate(44_100, 2);
        assert!(!r.is_passthrough());
        assert!((r.ratio() - 48_000.0 / 44_100.0).abs() < 1e-9);
    }

    #[test]
    fn test_upsample_produces_more_frames() {
        let mut r = Resampler::to_bus_rate(24_000, 2);
        // Feed 2048 frames (4096 interleaved samples) of silence
        let input = vec![0.0f32; 4096];
        let mut total = r.process(&input).len();
        total += r.flush().len();
        // 2:1 upsample of 2048 frames is ~4096 frames = ~8192 samples
        assert!(total > 6000, "got {total} samples");
    }

    #[test]
    fn test_reset_clears_pending() {
        let mut r = Resampler::to_bus_rate(44_100, 2);
        r.process(&vec![0.5f32; 100]);
        r.reset();
        assert!(r.flush().is_empty());
    }
}
