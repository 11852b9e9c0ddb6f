//! Local file playback source.
//!
//! A producer thread decodes the current queue item with symphonia,
//! converts it to the bus format and keeps the source ring topped up. The
//! control side mutates the queue and forwards transport commands; track
//! advancement at end-of-stream happens inside the producer so playback
//! never gaps waiting for the control plane.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::audio::ring::{PcmWriter, pcm_ring};
use crate::audio::{Resampler, SAMPLES_PER_TICK, to_stereo};
use crate::db::SourcePrefs;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::mixer::{BalanceCell, MixerFeed};
use crate::source::decoder::{AudioDecoder, is_supported_extension, read_tags};
use crate::source::queue::{
    Advance, PlayQueue, QueueChange, QueueItem, RemovalOutcome, RepeatMode, TrackEntry,
};
use crate::source::{
    AudioSource, Capabilities, MetadataKey, SourceKind, SourceState, StateCell, TrackMetadata,
    VolumeCell,
};

/// Ring capacity: one second of bus audio.
const RING_CAPACITY: usize = 96_000;

/// Stop decoding ahead once this much is pending.
const PENDING_HIGH_WATER: usize = SAMPLES_PER_TICK * 8;

enum WorkerCmd {
    Load {
        path: PathBuf,
        start_at: Option<Duration>,
        autoplay: bool,
    },
    Play,
    Pause,
    Stop,
    Seek(Duration),
    Shutdown,
}

/// State shared between the control side and the producer thread.
struct FileShared {
    state: StateCell,
    queue: Mutex<PlayQueue>,
    metadata: Mutex<TrackMetadata>,
    duration: Mutex<Option<Duration>>,
    position_nanos: AtomicU64,
    has_track: AtomicBool,
    root: PathBuf,
}

impl FileShared {
    fn set_position(&self, position: Duration) {
        self.position_nanos
            .store(position.as_nanos() as u64, Ordering::Relaxed);
    }

    fn publish_queue_change(&self, change: QueueChange) {
        self.state.bus().publish(EngineEvent::QueueChanged {
            source_id: self.state.source_id().to_string(),
            change,
        });
    }

    fn publish_metadata_changed(&self) {
        self.state.bus().publish(EngineEvent::MetadataChanged {
            source_id: self.state.source_id().to_string(),
        });
    }
}

/// File-specific control facet, reached through `as_files()`.
pub trait FileControl: Send + Sync {
    /// Replace the queue with a single file and make it current.
    fn load_file(&self, relative_path: &str) -> Result<()>;
    /// Replace the queue with a directory's supported files; returns how
    /// many were loaded.
    fn load_directory(&self, relative_dir: &str) -> Result<usize>;
}

/// The file playback source.
pub struct FilePlayer {
    id: String,
    name: String,
    shared: Arc<FileShared>,
    volume: Arc<VolumeCell>,
    balance: Arc<BalanceCell>,
    feed: Mutex<Option<MixerFeed>>,
    worker: Mutex<Option<Worker>>,
    /// Restored prefs applied on initialize
    restored: Mutex<Option<SourcePrefs>>,
    /// Track to reload (with position) from the restored prefs
    pending_restore: Mutex<Option<(PathBuf, Duration)>>,
    /// Seed for deterministic shuffle (tests/config); None = entropy
    shuffle_seed: Mutex<Option<u64>>,
    prefs_tx: Option<Sender<SourcePrefs>>,
}

struct Worker {
    tx: Sender<WorkerCmd>,
    handle: JoinHandle<()>,
}

impl FilePlayer {
    pub fn new(
        id: impl Into<String>,
        root: PathBuf,
        bus: Arc<EventBus>,
        restored: Option<SourcePrefs>,
        prefs_tx: Option<Sender<SourcePrefs>>,
    ) -> Self {
        let id = id.into();
        Self {
            name: "File Player".to_string(),
            shared: Arc::new(FileShared {
                state: StateCell::new(id.clone(), bus),
                queue: Mutex::new(PlayQueue::new()),
                metadata: Mutex::new(TrackMetadata::new()),
                duration: Mutex::new(None),
                position_nanos: AtomicU64::new(0),
                has_track: AtomicBool::new(false),
                root,
            }),
            volume: Arc::new(VolumeCell::default()),
            balance: Arc::new(BalanceCell::default()),
            feed: Mutex::new(None),
            worker: Mutex::new(None),
            restored: Mutex::new(restored),
            pending_restore: Mutex::new(None),
            shuffle_seed: Mutex::new(None),
            prefs_tx,
            id,
        }
    }

    /// Fix the shuffle seed (deterministic permutations).
    pub fn set_shuffle_seed(&self, seed: Option<u64>) {
        *self.shuffle_seed.lock() = seed;
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative = relative.trim_start_matches(['/', '\\']);
        let path = self.shared.root.join(relative);
        // Containment check: the file source never leaves its root
        if relative.split(['/', '\\']).any(|part| part == "..") {
            return Err(Error::invalid_argument("path may not contain '..'"));
        }
        Ok(path)
    }

    /// Replace the queue with a single file and make it current.
    pub fn load_file(&self, relative_path: &str) -> Result<()> {
        let path = self.resolve(relative_path)?;
        validate_audio_file(&path)?;

        let mut queue = self.shared.queue.lock();
        if !queue.is_empty() {
            let cleared = queue.clear();
            self.shared.publish_queue_change(cleared);
        }
        let change = queue.add(entry_for(&path, &self.shared.root), None)?;
        drop(queue);
        self.shared.publish_queue_change(change);

        self.send_load(path, None, self.state() == SourceState::Playing);
        Ok(())
    }

    /// Load every supported file under a directory (non-recursive order
    /// is directory order, sorted for stability).
    pub fn load_directory(&self, relative_dir: &str) -> Result<usize> {
        let dir = self.resolve(relative_dir)?;
        if !dir.is_dir() {
            return Err(Error::not_found(dir.display().to_string()));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_supported_extension(p))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(Error::invalid_argument(format!(
                "no supported audio files in {}",
                dir.display()
            )));
        }

        let mut queue = self.shared.queue.lock();
        if !queue.is_empty() {
            let cleared = queue.clear();
            self.shared.publish_queue_change(cleared);
        }
        let mut changes = Vec::with_capacity(files.len());
        for file in &files {
            changes.push(queue.add(entry_for(file, &self.shared.root), None)?);
        }
        // A pre-enabled shuffle applies to the freshly resolved list
        if queue.shuffled() {
            let seed = *self.shuffle_seed.lock();
            queue.set_shuffle(false, None);
            queue.set_shuffle(true, seed);
        }
        let count = files.len();
        drop(queue);

        for change in changes {
            self.shared.publish_queue_change(change);
        }
        Ok(count)
    }

    fn send(&self, cmd: WorkerCmd) {
        if let Some(worker) = self.worker.lock().as_ref() {
            let _ = worker.tx.send(cmd);
        }
    }

    fn send_load(&self, path: PathBuf, start_at: Option<Duration>, autoplay: bool) {
        self.shared.has_track.store(true, Ordering::Relaxed);
        self.send(WorkerCmd::Load {
            path,
            start_at,
            autoplay,
        });
    }

    /// Load the current queue entry into the producer.
    fn load_current(&self, autoplay: bool) {
        let path = {
            let queue = self.shared.queue.lock();
            queue.current_entry().map(|e| self.shared.root.join(&e.id))
        };
        if let Some(path) = path {
            self.send_load(path, None, autoplay);
        }
    }

    fn stop_internal(&self, operation: &str) -> Result<()> {
        self.shared.state.transition(SourceState::Stopped, operation)?;
        self.send(WorkerCmd::Stop);
        Ok(())
    }
}

impl AudioSource for FilePlayer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::FilePlayer
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEEKABLE
            | Capabilities::QUEUE
            | Capabilities::NEXT
            | Capabilities::PREVIOUS
            | Capabilities::SHUFFLE
            | Capabilities::REPEAT
    }

    fn state(&self) -> SourceState {
        self.shared.state.get()
    }

    fn initialize(&self) -> Result<()> {
        self.shared.state.transition(SourceState::Initializing, "initialize")?;

        // Tear down a previous worker when re-initializing out of Error
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.tx.send(WorkerCmd::Shutdown);
            let _ = worker.handle.join();
        }

        let (writer, reader) = pcm_ring(RING_CAPACITY);
        *self.feed.lock() = Some(MixerFeed {
            source_id: self.id.clone(),
            reader,
            volume: Arc::clone(&self.volume),
            balance: Arc::clone(&self.balance),
            duck_exempt: false,
            is_event: false,
        });

        let (tx, rx) = bounded(32);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("file-decode-{}", self.id))
            .spawn(move || decode_loop(shared, rx, writer))
            .map_err(|e| Error::external(e.to_string()))?;
        *self.worker.lock() = Some(Worker { tx, handle });

        // Restore persisted preferences
        if let Some(prefs) = self.restored.lock().take() {
            let mut queue = self.shared.queue.lock();
            queue.set_repeat(prefs.repeat);
            if prefs.shuffle {
                queue.set_shuffle(true, *self.shuffle_seed.lock());
            }
            drop(queue);
            if let Some(last) = prefs.last_played {
                let path = self.shared.root.join(&last);
                if path.is_file() {
                    *self.pending_restore.lock() =
                        Some((path, Duration::from_millis(prefs.position_ms)));
                } else {
                    tracing::debug!(file = %last, "restored track no longer exists");
                }
            }
        }

        self.shared.state.transition(SourceState::Ready, "initialize")?;
        Ok(())
    }

    fn play(&self) -> Result<()> {
        let previous = self.shared.state.transition(SourceState::Playing, "play")?;
        if previous == SourceState::Paused {
            self.send(WorkerCmd::Play);
            return Ok(());
        }

        if let Some((path, position)) = self.pending_restore.lock().take() {
            let relative = path
                .strip_prefix(&self.shared.root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            let mut queue = self.shared.queue.lock();
            if queue.is_empty() {
                let change = queue.add(entry_for(&path, &self.shared.root), None)?;
                drop(queue);
                self.shared.publish_queue_change(change);
                tracing::info!(file = %relative, "resuming restored track");
                self.send_load(path, Some(position), true);
                return Ok(());
            }
        }

        if self.shared.has_track.load(Ordering::Relaxed) {
            self.send(WorkerCmd::Play);
        } else {
            self.load_current(true);
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.shared.state.transition(SourceState::Paused, "pause")?;
        self.send(WorkerCmd::Pause);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.shared.state.transition(SourceState::Playing, "resume")?;
        self.send(WorkerCmd::Play);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_internal("stop")
    }

    fn seek(&self, position: Duration) -> Result<()> {
        match self.state() {
            SourceState::Playing | SourceState::Paused => {
                self.send(WorkerCmd::Seek(position));
                Ok(())
            }
            state => Err(Error::illegal_state("seek", state)),
        }
    }

    fn dispose(&self) -> Result<()> {
        if !self.shared.state.dispose() {
            return Ok(());
        }

        if let Some(tx) = &self.prefs_tx {
            let queue = self.shared.queue.lock();
            let last_played = queue.current_entry().map(|e| e.id.clone());
            let prefs = SourcePrefs {
                source_id: self.id.clone(),
                last_played,
                position_ms: self.position().unwrap_or_default().as_millis() as u64,
                shuffle: queue.shuffled(),
                repeat: queue.repeat(),
            };
            drop(queue);
            let _ = tx.send(prefs);
        }

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.tx.send(WorkerCmd::Shutdown);
            let _ = worker.handle.join();
        }
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        self.shared
            .has_track
            .load(Ordering::Relaxed)
            .then(|| Duration::from_nanos(self.shared.position_nanos.load(Ordering::Relaxed)))
    }

    fn duration(&self) -> Option<Duration> {
        *self.shared.duration.lock()
    }

    fn metadata(&self) -> TrackMetadata {
        self.shared.metadata.lock().clone()
    }

    fn merge_metadata(&self, overlay: TrackMetadata) {
        let mut metadata = self.shared.metadata.lock();
        for (key, value) in overlay.iter() {
            metadata.set(*key, value.clone());
        }
        drop(metadata);
        self.shared.publish_metadata_changed();
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

    // ---- queue operations ----

    fn queue_snapshot(&self) -> Result<Vec<QueueItem>> {
        Ok(self.shared.queue.lock().snapshot())
    }

    fn add_to_queue(&self, identifier: &str, position: Option<usize>) -> Result<QueueItem> {
        let path = self.resolve(identifier)?;
        validate_audio_file(&path)?;
        let change = self
            .shared
            .queue
            .lock()
            .add(entry_for(&path, &self.shared.root), position)?;
        let item = change.affected_item.clone().expect("add always carries the item");
        self.shared.publish_queue_change(change);
        Ok(item)
    }

    fn remove_from_queue(&self, index: usize) -> Result<()> {
        let (change, outcome) = self.shared.queue.lock().remove(index)?;
        self.shared.publish_queue_change(change);
        match outcome {
            RemovalOutcome::Unaffected => {}
            RemovalOutcome::CurrentMoved(_) => {
                // Keep playing with the item that slid into place
                self.load_current(self.state() == SourceState::Playing);
            }
            RemovalOutcome::BecameEmpty => {
                self.shared.has_track.store(false, Ordering::Relaxed);
                if matches!(self.state(), SourceState::Playing | SourceState::Paused) {
                    self.stop_internal("remove_from_queue")?;
                }
            }
        }
        Ok(())
    }

    fn clear_queue(&self) -> Result<()> {
        let change = self.shared.queue.lock().clear();
        self.shared.publish_queue_change(change);
        self.shared.has_track.store(false, Ordering::Relaxed);
        if matches!(self.state(), SourceState::Playing | SourceState::Paused) {
            self.stop_internal("clear_queue")?;
        }
        Ok(())
    }

    fn move_queue_item(&self, from: usize, to: usize) -> Result<()> {
        let change = self.shared.queue.lock().move_item(from, to)?;
        self.shared.publish_queue_change(change);
        Ok(())
    }

    fn jump_to_index(&self, index: usize) -> Result<()> {
        let change = self.shared.queue.lock().jump_to(index)?;
        self.shared.publish_queue_change(change);
        match self.state() {
            SourceState::Playing => {}
            SourceState::Ready | SourceState::Stopped | SourceState::Paused => {
                self.shared.state.transition(SourceState::Playing, "jump_to_index")?;
            }
            state => return Err(Error::illegal_state("jump_to_index", state)),
        }
        self.load_current(true);
        Ok(())
    }

    fn next(&self) -> Result<()> {
        let advance = self.shared.queue.lock().advance_next();
        match advance {
            Advance::Item(index) => {
                let change = {
                    let queue = self.shared.queue.lock();
                    QueueChange {
                        change_type: crate::source::queue::QueueChangeType::CurrentChanged,
                        affected_index: Some(index),
                        affected_item: queue.snapshot().into_iter().nth(index),
                    }
                };
                self.shared.publish_queue_change(change);
                self.load_current(self.state() == SourceState::Playing);
                Ok(())
            }
            Advance::RestartCurrent => {
                self.shared.set_position(Duration::ZERO);
                self.send(WorkerCmd::Seek(Duration::ZERO));
                if self.state() == SourceState::Paused {
                    self.resume()?;
                }
                Ok(())
            }
            Advance::EndOfQueue => {
                if matches!(self.state(), SourceState::Playing | SourceState::Paused) {
                    self.stop_internal("next")?;
                }
                Ok(())
            }
        }
    }

    fn previous(&self) -> Result<()> {
        // More than three seconds in: restart the current track
        if self.position().unwrap_or_default() > Duration::from_secs(3) {
            return self.seek(Duration::ZERO);
        }
        let advance = self.shared.queue.lock().advance_previous();
        match advance {
            Advance::Item(index) => {
                let change = {
                    let queue = self.shared.queue.lock();
                    QueueChange {
                        change_type: crate::source::queue::QueueChangeType::CurrentChanged,
                        affected_index: Some(index),
                        affected_item: queue.snapshot().into_iter().nth(index),
                    }
                };
                self.shared.publish_queue_change(change);
                self.load_current(self.state() == SourceState::Playing);
                Ok(())
            }
            Advance::RestartCurrent => {
                if matches!(self.state(), SourceState::Playing | SourceState::Paused) {
                    self.seek(Duration::ZERO)
                } else {
                    Ok(())
                }
            }
            Advance::EndOfQueue => Ok(()),
        }
    }

    fn set_shuffle(&self, enabled: bool) -> Result<()> {
        let seed = *self.shuffle_seed.lock();
        if let Some(change) = self.shared.queue.lock().set_shuffle(enabled, seed) {
            self.shared.publish_queue_change(change);
        }
        Ok(())
    }

    fn shuffle_enabled(&self) -> bool {
        self.shared.queue.lock().shuffled()
    }

    fn set_repeat(&self, mode: RepeatMode) -> Result<()> {
        self.shared.queue.lock().set_repeat(mode);
        Ok(())
    }

    fn repeat_mode(&self) -> RepeatMode {
        self.shared.queue.lock().repeat()
    }

    fn as_files(&self) -> Option<&dyn FileControl> {
        Some(self)
    }
}

impl FileControl for FilePlayer {
    fn load_file(&self, relative_path: &str) -> Result<()> {
        FilePlayer::load_file(self, relative_path)
    }

    fn load_directory(&self, relative_dir: &str) -> Result<usize> {
        FilePlayer::load_directory(self, relative_dir)
    }
}

fn validate_audio_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(Error::not_found(path.display().to_string()));
    }
    if !is_supported_extension(path) {
        return Err(Error::invalid_argument(format!(
            "unsupported format: {}",
            path.display()
        )));
    }
    Ok(())
}

fn entry_for(path: &Path, root: &Path) -> TrackEntry {
    let tags = read_tags(path);
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    TrackEntry {
        id: relative,
        title: tags.display_title().to_string(),
        artist: tags.text(MetadataKey::Artist).map(str::to_string),
        album: tags.text(MetadataKey::Album).map(str::to_string),
        duration: tags
            .get(MetadataKey::Duration)
            .and_then(|v| match v {
                crate::source::MetadataValue::Float(secs) => {
                    Some(Duration::from_secs_f64(*secs))
                }
                _ => None,
            }),
        album_art_url: None,
    }
}

// ============================================================================
// Producer thread
// ============================================================================

struct DecodeState {
    decoder: AudioDecoder,
    resampler: Resampler,
    /// Frames delivered so far, at the native rate
    frames_done: u64,
    native_rate: u32,
    native_channels: u16,
}

fn decode_loop(shared: Arc<FileShared>, rx: Receiver<WorkerCmd>, mut writer: PcmWriter) {
    let mut current: Option<DecodeState> = None;
    let mut playing = false;
    let mut pending: Vec<f32> = Vec::new();
    let mut stereo_scratch: Vec<f32> = Vec::new();

    loop {
        // Block while idle, poll while producing
        let cmd = if playing && current.is_some() {
            rx.try_recv().ok()
        } else {
            rx.recv_timeout(Duration::from_millis(50)).ok()
        };

        match cmd {
            Some(WorkerCmd::Load {
                path,
                start_at,
                autoplay,
            }) => {
                pending.clear();
                match open_track(&shared, &path, start_at) {
                    Ok(state) => {
                        current = Some(state);
                        if autoplay {
                            playing = true;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(file = %path.display(), "load failed: {e}");
                        shared.state.fail(&e);
                        current = None;
                        playing = false;
                    }
                }
            }
            Some(WorkerCmd::Play) => playing = true,
            Some(WorkerCmd::Pause) => playing = false,
            Some(WorkerCmd::Stop) => {
                playing = false;
                pending.clear();
                if let Some(state) = current.as_mut() {
                    state.resampler.reset();
                    if let Ok(landed) = state.decoder.seek(Duration::ZERO) {
                        state.frames_done =
                            (landed.as_secs_f64() * state.native_rate as f64) as u64;
                    } else {
                        state.frames_done = 0;
                    }
                }
                shared.set_position(Duration::ZERO);
            }
            Some(WorkerCmd::Seek(position)) => {
                if let Some(state) = current.as_mut() {
                    pending.clear();
                    state.resampler.reset();
                    match state.decoder.seek(position) {
                        Ok(landed) => {
                            state.frames_done =
                                (landed.as_secs_f64() * state.native_rate as f64) as u64;
                            shared.set_position(landed);
                        }
                        Err(e) => tracing::warn!("seek failed: {e}"),
                    }
                }
            }
            Some(WorkerCmd::Shutdown) => return,
            None => {}
        }

        if !playing {
            continue;
        }

        let mut track_ended = false;
        let mut decode_error = None;
        {
            let Some(state) = current.as_mut() else {
                continue;
            };

            // Push what we already have
            if !pending.is_empty() {
                let written = writer.push(&pending);
                pending.drain(..written);
            }

            // Decode ahead while there is room
            if pending.len() < PENDING_HIGH_WATER {
                match state.decoder.next_block() {
                    Ok(Some(block)) => {
                        state.frames_done +=
                            (block.len() / state.native_channels as usize) as u64;
                        to_stereo(&block, state.native_channels as usize, &mut stereo_scratch);
                        pending.extend(state.resampler.process(&stereo_scratch));
                        shared.set_position(Duration::from_secs_f64(
                            state.frames_done as f64 / state.native_rate as f64,
                        ));
                    }
                    Ok(None) => {
                        pending.extend(state.resampler.flush());
                        track_ended = true;
                    }
                    Err(e) => decode_error = Some(e),
                }
            } else if writer.space() == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        if let Some(e) = decode_error {
            tracing::warn!("decode failed: {e}");
            shared.state.fail(&e);
            current = None;
            playing = false;
            continue;
        }

        if track_ended {
            // Drain the tail of the track into the ring
            while !pending.is_empty() {
                let written = writer.push(&pending);
                pending.drain(..written);
                if written == 0 {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            match advance_at_end(&shared) {
                Some(next_path) => match open_track(&shared, &next_path, None) {
                    Ok(next_state) => current = Some(next_state),
                    Err(e) => {
                        tracing::warn!("auto-advance load failed: {e}");
                        shared.state.fail(&e);
                        current = None;
                        playing = false;
                    }
                },
                None => {
                    playing = false;
                    current = None;
                    shared.has_track.store(false, Ordering::Relaxed);
                    let _ = shared.state.transition(SourceState::Stopped, "end of queue");
                }
            }
        }
    }
}

fn open_track(
    shared: &Arc<FileShared>,
    path: &Path,
    start_at: Option<Duration>,
) -> Result<DecodeState> {
    let mut decoder = AudioDecoder::open(path)?;
    let native_rate = decoder.sample_rate();
    let native_channels = decoder.channels();

    let mut frames_done = 0u64;
    if let Some(position) = start_at {
        if let Ok(landed) = decoder.seek(position) {
            frames_done = (landed.as_secs_f64() * native_rate as f64) as u64;
            shared.set_position(landed);
        }
    } else {
        shared.set_position(Duration::ZERO);
    }

    *shared.duration.lock() = decoder.duration();
    let mut tags = read_tags(path);
    tags.set_text(MetadataKey::Source, "File");
    *shared.metadata.lock() = tags;
    shared.has_track.store(true, Ordering::Relaxed);
    shared.publish_metadata_changed();

    tracing::info!(
        file = %path.display(),
        rate = native_rate,
        channels = native_channels,
        "track loaded"
    );

    Ok(DecodeState {
        decoder,
        resampler: Resampler::to_bus_rate(native_rate, 2),
        frames_done,
        native_rate,
        native_channels,
    })
}

/// Advance the queue at end-of-stream; returns the next path to load.
fn advance_at_end(shared: &Arc<FileShared>) -> Option<PathBuf> {
    let mut queue = shared.queue.lock();
    match queue.advance_next() {
        Advance::Item(index) => {
            let entry = queue.current_entry()?.clone();
            let change = QueueChange {
                change_type: crate::source::queue::QueueChangeType::CurrentChanged,
                affected_index: Some(index),
                affected_item: queue.snapshot().into_iter().nth(index),
            };
            drop(queue);
            shared.publish_queue_change(change);
            Some(shared.root.join(entry.id))
        }
        Advance::RestartCurrent => {
            let entry = queue.current_entry()?.clone();
            drop(queue);
            Some(shared.root.join(entry.id))
        }
        Advance::EndOfQueue => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::source::queue::QueueChangeType;
    use tempfile::TempDir;

    /// Minimal valid WAV file: 16-bit mono, `frames` samples of silence.
    fn write_wav(dir: &Path, name: &str, frames: u32) -> PathBuf {
        let path = dir.join(name);
        let data_len = frames * 2;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
        bytes.extend_from_slice(&48_000u32.to_le_bytes());
        bytes.extend_from_slice(&(48_000u32 * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.extend(std::iter::repeat_n(0u8, data_len as usize));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn player(root: &TempDir) -> FilePlayer {
        FilePlayer::new(
            "file-1",
            root.path().to_path_buf(),
            Arc::new(EventBus::new()),
            None,
            None,
        )
    }

    #[test]
    fn test_load_file_rejects_bad_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let p = player(&dir);
        p.initialize().unwrap();
        let err = p.load_file("notes.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        p.dispose().unwrap();
    }

    #[test]
    fn test_load_file_rejects_missing() {
        let dir = TempDir::new().unwrap();
        let p = player(&dir);
        p.initialize().unwrap();
        let err = p.load_file("ghost.mp3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        p.dispose().unwrap();
    }

    #[test]
    fn test_load_directory_empty_fails() {
        let dir = TempDir::new().unwrap();
        let p = player(&dir);
        p.initialize().unwrap();
        assert!(p.load_directory("").is_err());
        p.dispose().unwrap();
    }

    #[test]
    fn test_directory_queue_round_trip() {
        let dir = TempDir::new().unwrap();
        write_wav(dir.path(), "a.wav", 480);
        write_wav(dir.path(), "b.wav", 480);
        write_wav(dir.path(), "c.wav", 480);

        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let p = FilePlayer::new("file-1", dir.path().to_path_buf(), bus, None, None);
        p.initialize().unwrap();

        assert_eq!(p.load_directory("").unwrap(), 3);
        let snapshot = p.queue_snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot[0].is_current);

        p.next().unwrap();
        let snapshot = p.queue_snapshot().unwrap();
        assert!(snapshot[1].is_current);

        // Position is zero, so previous moves back a track
        p.previous().unwrap();
        let snapshot = p.queue_snapshot().unwrap();
        assert!(snapshot[0].is_current);

        let changes: Vec<QueueChangeType> = rx
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::QueueChanged { change, .. } => Some(change.change_type),
                _ => None,
            })
            .collect();
        let added = changes.iter().filter(|c| **c == QueueChangeType::Added).count();
        let current_changes: Vec<_> = changes
            .iter()
            .filter(|c| **c == QueueChangeType::CurrentChanged)
            .collect();
        assert_eq!(added, 3);
        assert_eq!(current_changes.len(), 2);

        p.dispose().unwrap();
    }

    #[test]
    fn test_shuffle_determinism_on_five_tracks() {
        let dir = TempDir::new().unwrap();
        for name in ["a.wav", "b.wav", "c.wav", "d.wav", "e.wav"] {
            write_wav(dir.path(), name, 48);
        }
        let p = player(&dir);
        p.initialize().unwrap();
        p.set_shuffle_seed(Some(7));
        p.load_directory("").unwrap();

        let original: Vec<String> = p.queue_snapshot().unwrap().iter().map(|i| i.id.clone()).collect();

        p.set_shuffle(true).unwrap();
        let first: Vec<String> = p.queue_snapshot().unwrap().iter().map(|i| i.id.clone()).collect();

        p.set_shuffle(false).unwrap();
        let restored: Vec<String> = p.queue_snapshot().unwrap().iter().map(|i| i.id.clone()).collect();
        assert_eq!(restored, original);

        p.set_shuffle(true).unwrap();
        let second: Vec<String> = p.queue_snapshot().unwrap().iter().map(|i| i.id.clone()).collect();
        assert_eq!(first, second);

        p.dispose().unwrap();
    }

    #[test]
    fn test_dispose_sends_prefs() {
        let dir = TempDir::new().unwrap();
        write_wav(dir.path(), "a.wav", 480);
        let (tx, rx) = bounded(4);
        let p = FilePlayer::new(
            "file-1",
            dir.path().to_path_buf(),
            Arc::new(EventBus::new()),
            None,
            Some(tx),
        );
        p.initialize().unwrap();
        p.load_file("a.wav").unwrap();
        p.set_repeat(RepeatMode::All).unwrap();
        p.dispose().unwrap();

        let prefs = rx.try_recv().unwrap();
        assert_eq!(prefs.source_id, "file-1");
        assert_eq!(prefs.last_played.as_deref(), Some("a.wav"));
        assert_eq!(prefs.repeat, RepeatMode::All);
    }

    #[test]
    fn test_lifecycle_validation() {
        let dir = TempDir::new().unwrap();
        let p = player(&dir);
        // Play before initialize is illegal
        assert_eq!(p.play().unwrap_err().kind(), ErrorKind::IllegalState);
        p.initialize().unwrap();
        // Pause requires Playing
        assert_eq!(p.pause().unwrap_err().kind(), ErrorKind::IllegalState);
        p.dispose().unwrap();
        assert_eq!(p.play().unwrap_err().kind(), ErrorKind::AlreadyDisposed);
        // Dispose is idempotent
        p.dispose().unwrap();
    }
}
