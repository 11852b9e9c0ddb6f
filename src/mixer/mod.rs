//! Master mixer: pulls every source feed, sums into the canonical bus
//! and fans the result out to outputs and the visualization tap.
//!
//! # Architecture
//!
//! ```text
//! source producer tasks ──rtrb──▶ ┌──────────────────────────┐
//!                                 │  mixer thread (10ms tick) │
//! control plane ──crossbeam msg──▶│  gain / balance / duck    │──rtrb──▶ local output, viz
//!                                 │  master gain, soft-limit  │──bytes─▶ HTTP stream clients
//!                                 └──────────────────────────┘
//! ```
//!
//! The pull loop never blocks: feeds and taps arrive over a message
//! channel drained at tick start, per-row controls are atomics shared
//! with the owning source, and the published graph view swaps under a
//! single pointer. A feed whose producer died is dropped from the graph
//! and reported, never propagated as an error.

pub mod ducking;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::audio::ring::{ByteRing, PcmReader, PcmWriter};
use crate::audio::{FRAMES_PER_TICK, SAMPLES_PER_TICK, balance_gains, f32_to_i16_le, soft_clip};
use crate::source::VolumeCell;
use ducking::DuckingEngine;

/// Balance stored as f32 bits, clamped to [-1, 1].
#[derive(Debug)]
pub struct BalanceCell(AtomicU32);

impl Default for BalanceCell {
    fn default() -> Self {
        Self(AtomicU32::new(0.0_f32.to_bits()))
    }
}

impl BalanceCell {
    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, balance: f32) {
        self.0
            .store(balance.clamp(-1.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

/// A source's PCM feed plus the shared per-row controls, handed to the
/// mixer exactly once per source lifetime.
pub struct MixerFeed {
    pub source_id: String,
    pub reader: PcmReader,
    /// Shared with the source: its `set_volume` is the row gain
    pub volume: Arc<VolumeCell>,
    pub balance: Arc<BalanceCell>,
    /// Exempt rows never get the duck multiplier
    pub duck_exempt: bool,
    /// Event rows overlay; they are never ducked either
    pub is_event: bool,
}

/// One row of the published graph view.
#[derive(Debug, Clone)]
pub struct RowInfo {
    pub source_id: String,
    pub duck_exempt: bool,
    pub is_event: bool,
}

/// Control messages into the mixer thread.
pub enum MixerMsg {
    AddFeed(MixerFeed),
    RemoveFeed(String),
    /// Real-time f32 tap (local output, visualization)
    AddPcmTap { id: String, writer: PcmWriter },
    RemovePcmTap(String),
    /// Serialized 16-bit LE tap (HTTP stream clients)
    AddByteTap { id: String, ring: Arc<ByteRing> },
    RemoveByteTap(String),
    Shutdown,
}

/// Notifications out of the mixer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixerNotice {
    /// A feed's producer finished or died; the row was dropped.
    FeedExhausted(String),
}

/// State shared between the mixer thread and the control plane.
pub struct MixerShared {
    pub master_volume: VolumeCell,
    master_muted: AtomicBool,
    pub master_balance: BalanceCell,
    /// True while the bus carries non-silent audio
    active: AtomicBool,
    ticks: AtomicU64,
    underruns: AtomicU64,
    graph: ArcSwap<Vec<RowInfo>>,
}

impl MixerShared {
    fn new() -> Self {
        Self {
            master_volume: VolumeCell::default(),
            master_muted: AtomicBool::new(false),
            master_balance: BalanceCell::default(),
            active: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            graph: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.master_muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.master_muted.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Lock-free snapshot of the current rows.
    pub fn graph(&self) -> Arc<Vec<RowInfo>> {
        self.graph.load_full()
    }
}

/// The master mixer handle held by the orchestrator.
pub struct Mixer {
    msg_tx: Sender<MixerMsg>,
    shared: Arc<MixerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Mixer {
    /// Spawn the mixer thread. Returns the handle and the notice channel
    /// the orchestrator drains.
    pub fn spawn(ducking: Arc<DuckingEngine>) -> (Self, Receiver<MixerNotice>) {
        let (msg_tx, msg_rx) = unbounded();
        let (notice_tx, notice_rx) = bounded(64);
        let shared = Arc::new(MixerShared::new());

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("mixer-pull".to_string())
            .spawn(move || pull_loop(msg_rx, notice_tx, thread_shared, ducking))
            .expect("failed to spawn mixer thread");

        (
            Self {
                msg_tx,
                shared,
                thread: Some(thread),
            },
            notice_rx,
        )
    }

    pub fn shared(&self) -> &Arc<MixerShared> {
        &self.shared
    }

    /// Add a source row. The row set visible to the pull loop changes at
    /// the next tick boundary.
    pub fn add_feed(&self, feed: MixerFeed) {
        let _ = self.msg_tx.send(MixerMsg::AddFeed(feed));
    }

    pub fn remove_feed(&self, source_id: &str) {
        let _ = self.msg_tx.send(MixerMsg::RemoveFeed(source_id.to_string()));
    }

    /// Subscribe a real-time f32 consumer (local output, visualization).
    pub fn add_pcm_tap(&self, id: &str, writer: PcmWriter) {
        let _ = self.msg_tx.send(MixerMsg::AddPcmTap {
            id: id.to_string(),
            writer,
        });
    }

    pub fn remove_pcm_tap(&self, id: &str) {
        let _ = self.msg_tx.send(MixerMsg::RemovePcmTap(id.to_string()));
    }

    /// Subscribe a serialized 16-bit consumer (one per stream client).
    pub fn add_byte_tap(&self, id: &str, ring: Arc<ByteRing>) {
        let _ = self.msg_tx.send(MixerMsg::AddByteTap {
            id: id.to_string(),
            ring,
        });
    }

    pub fn remove_byte_tap(&self, id: &str) {
        let _ = self.msg_tx.send(MixerMsg::RemoveByteTap(id.to_string()));
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        let _ = self.msg_tx.send(MixerMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

const TICK: Duration = Duration::from_millis(10);

/// Silence threshold for the is_active flag.
const SILENCE_EPSILON: f32 = 1e-5;

struct Row {
    feed: MixerFeed,
}

struct PcmTap {
    id: String,
    writer: PcmWriter,
}

struct ByteTap {
    id: String,
    ring: Arc<ByteRing>,
}

fn pull_loop(
    msg_rx: Receiver<MixerMsg>,
    notice_tx: Sender<MixerNotice>,
    shared: Arc<MixerShared>,
    ducking: Arc<DuckingEngine>,
) {
    let mut rows: Vec<Row> = Vec::new();
    let mut pcm_taps: Vec<PcmTap> = Vec::new();
    let mut byte_taps: Vec<ByteTap> = Vec::new();

    let mut bus = vec![0.0f32; SAMPLES_PER_TICK];
    let mut scratch = vec![0.0f32; SAMPLES_PER_TICK];
    let mut serialized: Vec<u8> = Vec::with_capacity(SAMPLES_PER_TICK * 2);

    let mut next_tick = Instant::now();
    let mut graph_dirty = true;

    loop {
        // Apply control messages at the tick boundary
        loop {
            match msg_rx.try_recv() {
                Ok(MixerMsg::AddFeed(feed)) => {
                    tracing::debug!(source = %feed.source_id, "mix graph: row added");
                    rows.push(Row { feed });
                    graph_dirty = true;
                }
                Ok(MixerMsg::RemoveFeed(id)) => {
                    rows.retain(|r| r.feed.source_id != id);
                    graph_dirty = true;
                }
                Ok(MixerMsg::AddPcmTap { id, writer }) => {
                    pcm_taps.push(PcmTap { id, writer });
                }
                Ok(MixerMsg::RemovePcmTap(id)) => pcm_taps.retain(|t| t.id != id),
                Ok(MixerMsg::AddByteTap { id, ring }) => {
                    byte_taps.push(ByteTap { id, ring });
                }
                Ok(MixerMsg::RemoveByteTap(id)) => byte_taps.retain(|t| t.id != id),
                Ok(MixerMsg::Shutdown) => return,
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => return,
            }
        }

        // Drop rows whose producer has gone away and drained
        let mut exhausted: Vec<String> = Vec::new();
        rows.retain(|row| {
            if row.feed.reader.is_abandoned() && row.feed.reader.available() == 0 {
                exhausted.push(row.feed.source_id.clone());
                false
            } else {
                true
            }
        });
        for id in exhausted {
            tracing::debug!(source = %id, "mix graph: feed exhausted");
            let _ = notice_tx.try_send(MixerNotice::FeedExhausted(id));
            graph_dirty = true;
        }

        if graph_dirty {
            let view: Vec<RowInfo> = rows
                .iter()
                .map(|r| RowInfo {
                    source_id: r.feed.source_id.clone(),
                    duck_exempt: r.feed.duck_exempt,
                    is_event: r.feed.is_event,
                })
                .collect();
            shared.graph.store(Arc::new(view));
            graph_dirty = false;
        }

        // Mix one tick
        bus.fill(0.0);
        let duck_level = ducking.level();
        for row in rows.iter_mut() {
            let read = row.feed.reader.pop(&mut scratch);
            if read > 0 && read < SAMPLES_PER_TICK {
                shared.underruns.fetch_add(1, Ordering::Relaxed);
            }
            if read == 0 {
                continue;
            }

            let mut gain = row.feed.volume.get();
            if !row.feed.is_event && !row.feed.duck_exempt {
                gain *= duck_level;
            }
            let (left_gain, right_gain) = balance_gains(row.feed.balance.get());

            for (i, &sample) in scratch[..read].iter().enumerate() {
                let channel_gain = if i % 2 == 0 { left_gain } else { right_gain };
                bus[i] += sample * gain * channel_gain;
            }
        }

        // Master stage
        let master_gain = if shared.muted() {
            0.0
        } else {
            shared.master_volume.get()
        };
        let (master_left, master_right) = balance_gains(shared.master_balance.get());
        let mut any_signal = false;
        for (i, sample) in bus.iter_mut().enumerate() {
            let channel_gain = if i % 2 == 0 { master_left } else { master_right };
            *sample = soft_clip(*sample * master_gain * channel_gain);
            if sample.abs() > SILENCE_EPSILON {
                any_signal = true;
            }
        }
        shared.active.store(any_signal, Ordering::Relaxed);
        shared.ticks.fetch_add(1, Ordering::Relaxed);
        ducking.advance(FRAMES_PER_TICK);

        // Fan out
        pcm_taps.retain(|tap| !tap.writer.is_abandoned());
        for tap in pcm_taps.iter_mut() {
            tap.writer.push(&bus);
        }

        byte_taps.retain(|tap| !tap.ring.is_closed());
        if !byte_taps.is_empty() {
            f32_to_i16_le(&bus, &mut serialized);
            let chunk = Bytes::copy_from_slice(&serialized);
            for tap in byte_taps.iter() {
                tap.ring.push(chunk.clone());
            }
        }

        // Fixed-cadence schedule; skip sleeping if we fell behind
        next_tick += TICK;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else if now - next_tick > TICK * 10 {
            next_tick = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring::pcm_ring;

    fn test_feed(id: &str, capacity: usize) -> (crate::audio::ring::PcmWriter, MixerFeed) {
        let (writer, reader) = pcm_ring(capacity);
        (
            writer,
            MixerFeed {
                source_id: id.to_string(),
                reader,
                volume: Arc::new(VolumeCell::default()),
                balance: Arc::new(BalanceCell::default()),
                duck_exempt: false,
                is_event: false,
            },
        )
    }

    #[test]
    fn test_rows_sum_and_soft_limit() {
        // Drive the mixing math directly through a miniature bus
        let mut bus = [0.0f32; 4];
        for sample in [0.8f32, 0.8] {
            for slot in bus.iter_mut() {
                *slot += sample;
            }
        }
        for slot in bus.iter_mut() {
            *slot = soft_clip(*slot);
        }
        for &s in &bus {
            assert!(s.abs() <= 1.0);
        }
    }

    #[test]
    fn test_mixer_spawns_and_publishes_graph() {
        let ducking = Arc::new(DuckingEngine::default());
        let (mixer, _notices) = Mixer::spawn(ducking);

        let (mut writer, feed) = test_feed("s1", 9600);
        writer.push(&vec![0.5f32; 960]);
        mixer.add_feed(feed);

        // Give the pull loop a few ticks to apply the message
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if mixer.shared().graph().len() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "graph never updated");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(mixer.shared().graph()[0].source_id, "s1");

        mixer.remove_feed("s1");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !mixer.shared().graph().is_empty() {
            assert!(Instant::now() < deadline, "row never removed");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_exhausted_feed_reports_notice() {
        let ducking = Arc::new(DuckingEngine::default());
        let (mixer, notices) = Mixer::spawn(ducking);

        let (writer, feed) = test_feed("gone", 1024);
        mixer.add_feed(feed);
        drop(writer); // producer dies immediately

        let notice = notices
            .recv_timeout(Duration::from_secs(2))
            .expect("expected exhaustion notice");
        assert_eq!(notice, MixerNotice::FeedExhausted("gone".to_string()));
    }

    #[test]
    fn test_byte_tap_receives_serialized_audio() {
        let ducking = Arc::new(DuckingEngine::default());
        let (mixer, _notices) = Mixer::spawn(ducking);

        let (mut writer, feed) = test_feed("s1", 96000);
        mixer.add_feed(feed);

        let ring = Arc::new(ByteRing::new(1 << 20));
        mixer.add_byte_tap("client", Arc::clone(&ring));

        // Keep the feed topped up while we wait for serialized output
        let deadline = Instant::now() + Duration::from_secs(2);
        let chunk = loop {
            writer.push(&vec![0.25f32; 4800]);
            if let Some(chunk) = ring.try_recv() {
                break chunk;
            }
            assert!(Instant::now() < deadline, "no serialized audio arrived");
            std::thread::sleep(Duration::from_millis(5));
        };
        // One tick of stereo 16-bit audio
        assert_eq!(chunk.len(), SAMPLES_PER_TICK * 2);
        let first = i16::from_le_bytes([chunk[0], chunk[1]]);
        // Either silence (before the feed landed) or the 0.25 signal
        assert!(first == 0 || (first as f32 / i16::MAX as f32 - 0.25).abs() < 0.01);
    }
}
