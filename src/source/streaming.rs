//! Streaming service source.
//!
//! The remote service is reached through two narrow traits:
//! [`StreamingBackend`] (transport control, queue, decoded PCM) and
//! [`StreamingCatalog`] (search/browse, async because the control surface
//! calls it from request handlers). Both are injected so tests run
//! against mocks and the appliance builds without vendor credentials.
//!
//! The remote queue model is shallow: tracks can be appended and listed,
//! but the service does not permit removing, reordering or jumping, so
//! those operations report `NotSupported`.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::audio::ring::pcm_ring;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::mixer::{BalanceCell, MixerFeed};
use crate::source::queue::QueueItem;
use crate::source::{
    AudioSource, Capabilities, MetadataKey, MetadataValue, SourceKind, SourceState, StateCell,
    TrackMetadata, VolumeCell,
};

/// A track as known by the remote service.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RemoteTrack {
    pub uri: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration: Option<Duration>,
    pub album_art_url: Option<String>,
}

/// Search result item types the catalog understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Track,
    Album,
    Playlist,
    Artist,
    Show,
    Audiobook,
}

impl SearchType {
    /// Parse one requested type. `music` is an alias for `track`; `all`
    /// expands to every type.
    pub fn parse_list(raw: &str) -> Result<Vec<SearchType>> {
        let mut out = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_ascii_lowercase().as_str() {
                "track" | "music" => out.push(Self::Track),
                "album" => out.push(Self::Album),
                "playlist" => out.push(Self::Playlist),
                "artist" => out.push(Self::Artist),
                "show" => out.push(Self::Show),
                "audiobook" => out.push(Self::Audiobook),
                "all" => {
                    return Ok(vec![
                        Self::Track,
                        Self::Album,
                        Self::Playlist,
                        Self::Artist,
                        Self::Show,
                        Self::Audiobook,
                    ]);
                }
                other => {
                    return Err(Error::invalid_argument(format!(
                        "unknown search type: {other}"
                    )));
                }
            }
        }
        if out.is_empty() {
            out.push(Self::Track);
        }
        out.dedup();
        Ok(out)
    }
}

/// Typed search results.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SearchResults {
    pub tracks: Vec<RemoteTrack>,
    pub albums: Vec<CatalogEntry>,
    pub playlists: Vec<CatalogEntry>,
    pub artists: Vec<CatalogEntry>,
    pub shows: Vec<CatalogEntry>,
    pub audiobooks: Vec<CatalogEntry>,
}

/// A browsable catalog entity (category, album, playlist, artist...).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub image_url: Option<String>,
}

/// Full playlist contents.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaylistDetails {
    pub playlist: CatalogEntry,
    pub tracks: Vec<RemoteTrack>,
}

/// Transport-side contract to the remote service.
pub trait StreamingBackend: Send + Sync {
    fn play(&self, uri: &str, context_uri: Option<&str>) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn seek(&self, position: Duration) -> Result<()>;
    fn skip_next(&self) -> Result<()>;
    fn skip_previous(&self) -> Result<()>;
    fn add_to_queue(&self, uri: &str) -> Result<()>;
    fn queue(&self) -> Result<Vec<RemoteTrack>>;
    fn now_playing(&self) -> Result<Option<RemoteTrack>>;
    fn position(&self) -> Option<Duration>;
    /// Next block of decoded audio in bus format; empty when idle.
    fn read_block(&self) -> Vec<f32>;
}

/// Search/browse contract, called from async request handlers.
#[async_trait]
pub trait StreamingCatalog: Send + Sync {
    async fn search(&self, query: &str, types: &[SearchType]) -> Result<SearchResults>;
    async fn browse_categories(&self) -> Result<Vec<CatalogEntry>>;
    async fn category_playlists(&self, category_id: &str) -> Result<Vec<CatalogEntry>>;
    async fn user_playlists(&self) -> Result<Vec<CatalogEntry>>;
    async fn playlist_details(&self, playlist_id: &str) -> Result<PlaylistDetails>;
}

/// Streaming-specific facet reached through `as_streaming()`.
pub trait StreamingControl: Send + Sync {
    /// Start a resource URI, optionally inside an album/playlist context.
    fn play_uri(&self, uri: &str, context_uri: Option<&str>) -> Result<()>;
}

pub struct StreamingSource {
    id: String,
    name: String,
    state: StateCell,
    volume: Arc<VolumeCell>,
    balance: Arc<BalanceCell>,
    backend: Arc<dyn StreamingBackend>,
    metadata: Mutex<TrackMetadata>,
    duration: Mutex<Option<Duration>>,
    feed: Mutex<Option<MixerFeed>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl StreamingSource {
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn StreamingBackend>,
        bus: Arc<EventBus>,
    ) -> Self {
        let id = id.into();
        Self {
            name: "Streaming".to_string(),
            state: StateCell::new(id.clone(), bus),
            volume: Arc::new(VolumeCell::default()),
            balance: Arc::new(BalanceCell::default()),
            backend,
            metadata: Mutex::new(TrackMetadata::new()),
            duration: Mutex::new(None),
            feed: Mutex::new(None),
            worker: Mutex::new(None),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            id,
        }
    }

    fn refresh_now_playing(&self) {
        match self.backend.now_playing() {
            Ok(Some(track)) => {
                let mut meta = TrackMetadata::new();
                meta.set_text(MetadataKey::Title, track.title);
                meta.set_text(MetadataKey::Artist, track.artist);
                meta.set_text(MetadataKey::Album, track.album);
                if let Some(art) = track.album_art_url {
                    meta.set_text(MetadataKey::AlbumArtUrl, art);
                }
                if let Some(duration) = track.duration {
                    meta.set(
                        MetadataKey::Duration,
                        MetadataValue::Float(duration.as_secs_f64()),
                    );
                }
                meta.set_text(MetadataKey::Source, "Streaming");
                *self.duration.lock() = track.duration;
                *self.metadata.lock() = meta;
            }
            Ok(None) => {
                *self.duration.lock() = None;
                *self.metadata.lock() = TrackMetadata::new();
            }
            Err(e) => tracing::debug!("now_playing poll failed: {e}"),
        }
        self.state.bus().publish(EngineEvent::MetadataChanged {
            source_id: self.id.clone(),
        });
    }
}

impl AudioSource for StreamingSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Streaming
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEEKABLE | Capabilities::QUEUE | Capabilities::NEXT | Capabilities::PREVIOUS
    }

    fn state(&self) -> SourceState {
        self.state.get()
    }

    fn initialize(&self) -> Result<()> {
        self.state.transition(SourceState::Initializing, "initialize")?;

        let (writer, reader) = pcm_ring(96_000);
        *self.feed.lock() = Some(MixerFeed {
            source_id: self.id.clone(),
            reader,
            volume: Arc::clone(&self.volume),
            balance: Arc::clone(&self.balance),
            duck_exempt: false,
            is_event: false,
        });

        self.cancelled.store(false, Ordering::Release);
        let backend = Arc::clone(&self.backend);
        let cancelled = Arc::clone(&self.cancelled);
        let mut writer = writer;
        let handle = std::thread::Builder::new()
            .name(format!("streaming-{}", self.id))
            .spawn(move || {
                while !cancelled.load(Ordering::Acquire) {
                    let block = backend.read_block();
                    if block.is_empty() {
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    let mut offset = 0;
                    while offset < block.len() && !cancelled.load(Ordering::Acquire) {
                        let written = writer.push(&block[offset..]);
                        offset += written;
                        if written == 0 {
                            std::thread::sleep(Duration::from_millis(3));
                        }
                    }
                }
            })
            .map_err(|e| Error::external(e.to_string()))?;
        *self.worker.lock() = Some(handle);

        self.state.transition(SourceState::Ready, "initialize")?;
        Ok(())
    }

    fn play(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "play")?;
        if let Err(e) = self.backend.resume() {
            self.state.fail(&e);
            return Err(e);
        }
        self.refresh_now_playing();
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.state.transition(SourceState::Paused, "pause")?;
        self.backend.pause()
    }

    fn resume(&self) -> Result<()> {
        self.state.transition(SourceState::Playing, "resume")?;
        self.backend.resume()
    }

    fn stop(&self) -> Result<()> {
        self.state.transition(SourceState::Stopped, "stop")?;
        self.backend.stop()
    }

    fn seek(&self, position: Duration) -> Result<()> {
        match self.state() {
            SourceState::Playing | SourceState::Paused => self.backend.seek(position),
            state => Err(Error::illegal_state("seek", state)),
        }
    }

    fn dispose(&self) -> Result<()> {
        if !self.state.dispose() {
            return Ok(());
        }
        let _ = self.backend.stop();
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        self.backend.position()
    }

    fn duration(&self) -> Option<Duration> {
        *self.duration.lock()
    }

    fn metadata(&self) -> TrackMetadata {
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

    // ---- queue: append and list only; the service forbids the rest ----

    fn queue_snapshot(&self) -> Result<Vec<QueueItem>> {
        let remote = self.backend.queue()?;
        let current = self.backend.now_playing().ok().flatten();
        Ok(remote
            .into_iter()
            .enumerate()
            .map(|(index, track)| QueueItem {
                is_current: current.as_ref().is_some_and(|c| c.uri == track.uri),
                id: track.uri,
                title: track.title,
                artist: Some(track.artist),
                album: Some(track.album),
                duration: track.duration,
                album_art_url: track.album_art_url,
                index,
            })
            .collect())
    }

    fn add_to_queue(&self, identifier: &str, position: Option<usize>) -> Result<QueueItem> {
        if position.is_some() {
            return Err(Error::not_supported(
                "the streaming service only appends to its queue",
            ));
        }
        self.backend.add_to_queue(identifier)?;
        let queue = self.queue_snapshot()?;
        queue
            .into_iter()
            .rev()
            .find(|item| item.id == identifier)
            .ok_or_else(|| Error::external("queued track did not appear in the remote queue"))
    }

    fn remove_from_queue(&self, _index: usize) -> Result<()> {
        Err(Error::not_supported(
            "the streaming service does not permit queue removal",
        ))
    }

    fn clear_queue(&self) -> Result<()> {
        Err(Error::not_supported(
            "the streaming service does not permit clearing the queue",
        ))
    }

    fn move_queue_item(&self, _from: usize, _to: usize) -> Result<()> {
        Err(Error::not_supported(
            "the streaming service does not permit queue reordering",
        ))
    }

    fn jump_to_index(&self, _index: usize) -> Result<()> {
        Err(Error::not_supported(
            "the streaming service does not permit jumping by index",
        ))
    }

    fn next(&self) -> Result<()> {
        self.backend.skip_next()?;
        self.refresh_now_playing();
        Ok(())
    }

    fn previous(&self) -> Result<()> {
        self.backend.skip_previous()?;
        self.refresh_now_playing();
        Ok(())
    }

    fn as_streaming(&self) -> Option<&dyn StreamingControl> {
        Some(self)
    }
}

impl StreamingControl for StreamingSource {
    fn play_uri(&self, uri: &str, context_uri: Option<&str>) -> Result<()> {
        if uri.trim().is_empty() {
            return Err(Error::invalid_argument("uri must be non-empty"));
        }
        self.backend.play(uri, context_uri)?;
        match self.state() {
            SourceState::Playing => {}
            _ => {
                self.state.transition(SourceState::Playing, "play")?;
            }
        }
        self.refresh_now_playing();
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory backend/catalog used across the test suite.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MockBackend {
        pub queue: Mutex<Vec<RemoteTrack>>,
        pub now_playing: Mutex<Option<RemoteTrack>>,
        pub playing: Mutex<bool>,
    }

    impl MockBackend {
        pub fn track(uri: &str, title: &str) -> RemoteTrack {
            RemoteTrack {
                uri: uri.to_string(),
                title: title.to_string(),
                artist: "Artist".to_string(),
                album: "Album".to_string(),
                duration: Some(Duration::from_secs(180)),
                album_art_url: None,
            }
        }
    }

    impl StreamingBackend for MockBackend {
        fn play(&self, uri: &str, _context_uri: Option<&str>) -> Result<()> {
            *self.now_playing.lock() = Some(Self::track(uri, "Mock Track"));
            *self.playing.lock() = true;
            Ok(())
        }

        fn pause(&self) -> Result<()> {
            *self.playing.lock() = false;
            Ok(())
        }

        fn resume(&self) -> Result<()> {
            *self.playing.lock() = true;
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            *self.playing.lock() = false;
            Ok(())
        }

        fn seek(&self, _position: Duration) -> Result<()> {
            Ok(())
        }

        fn skip_next(&self) -> Result<()> {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return Ok(());
            }
            *self.now_playing.lock() = Some(queue.remove(0));
            Ok(())
        }

        fn skip_previous(&self) -> Result<()> {
            Ok(())
        }

        fn add_to_queue(&self, uri: &str) -> Result<()> {
            self.queue.lock().push(Self::track(uri, "Queued Track"));
            Ok(())
        }

        fn queue(&self) -> Result<Vec<RemoteTrack>> {
            Ok(self.queue.lock().clone())
        }

        fn now_playing(&self) -> Result<Option<RemoteTrack>> {
            Ok(self.now_playing.lock().clone())
        }

        fn position(&self) -> Option<Duration> {
            Some(Duration::ZERO)
        }

        fn read_block(&self) -> Vec<f32> {
            Vec::new()
        }
    }

    pub struct MockCatalog;

    #[async_trait]
    impl StreamingCatalog for MockCatalog {
        async fn search(&self, query: &str, types: &[SearchType]) -> Result<SearchResults> {
            let mut results = SearchResults::default();
            if types.contains(&SearchType::Track) {
                results.tracks.push(MockBackend::track("uri:track:1", query));
            }
            if types.contains(&SearchType::Album) {
                results.albums.push(CatalogEntry {
                    id: "album-1".to_string(),
                    name: format!("{query} album"),
                    uri: "uri:album:1".to_string(),
                    image_url: None,
                });
            }
            Ok(results)
        }

        async fn browse_categories(&self) -> Result<Vec<CatalogEntry>> {
            Ok(vec![CatalogEntry {
                id: "chill".to_string(),
                name: "Chill".to_string(),
                uri: "uri:category:chill".to_string(),
                image_url: None,
            }])
        }

        async fn category_playlists(&self, category_id: &str) -> Result<Vec<CatalogEntry>> {
            Ok(vec![CatalogEntry {
                id: format!("{category_id}-pl"),
                name: "Playlist".to_string(),
                uri: format!("uri:playlist:{category_id}"),
                image_url: None,
            }])
        }

        async fn user_playlists(&self) -> Result<Vec<CatalogEntry>> {
            Ok(Vec::new())
        }

        async fn playlist_details(&self, playlist_id: &str) -> Result<PlaylistDetails> {
            Ok(PlaylistDetails {
                playlist: CatalogEntry {
                    id: playlist_id.to_string(),
                    name: "Playlist".to_string(),
                    uri: format!("uri:playlist:{playlist_id}"),
                    image_url: None,
                },
                tracks: vec![MockBackend::track("uri:track:9", "From Playlist")],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;
    use crate::error::ErrorKind;

    fn source() -> (Arc<MockBackend>, StreamingSource) {
        let backend = Arc::new(MockBackend::default());
        let source = StreamingSource::new(
            "streaming-1",
            Arc::clone(&backend) as Arc<dyn StreamingBackend>,
            Arc::new(EventBus::new()),
        );
        (backend, source)
    }

    #[test]
    fn test_search_type_parsing() {
        assert_eq!(SearchType::parse_list("music").unwrap(), vec![SearchType::Track]);
        assert_eq!(
            SearchType::parse_list("track, album").unwrap(),
            vec![SearchType::Track, SearchType::Album]
        );
        assert_eq!(SearchType::parse_list("all").unwrap().len(), 6);
        assert_eq!(
            SearchType::parse_list("podcast").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_remote_queue_is_append_only() {
        let (_backend, source) = source();
        source.initialize().unwrap();

        source.add_to_queue("uri:track:42", None).unwrap();
        assert_eq!(source.queue_snapshot().unwrap().len(), 1);

        assert_eq!(
            source.add_to_queue("uri:track:43", Some(0)).unwrap_err().kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(source.remove_from_queue(0).unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(source.clear_queue().unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(source.move_queue_item(0, 1).unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(source.jump_to_index(0).unwrap_err().kind(), ErrorKind::NotSupported);

        source.dispose().unwrap();
    }

    #[test]
    fn test_play_uri_updates_metadata() {
        let (_backend, source) = source();
        source.initialize().unwrap();

        source.play_uri("uri:track:7", Some("uri:album:3")).unwrap();
        assert_eq!(source.state(), SourceState::Playing);
        assert_eq!(source.metadata().display_title(), "Mock Track");
        assert_eq!(source.duration(), Some(Duration::from_secs(180)));

        source.dispose().unwrap();
    }

    #[tokio::test]
    async fn test_mock_catalog_search() {
        use super::mock::MockCatalog;
        let catalog = MockCatalog;
        let results = catalog
            .search("night", &[SearchType::Track, SearchType::Album])
            .await
            .unwrap();
        assert_eq!(results.tracks.len(), 1);
        assert_eq!(results.albums.len(), 1);
    }
}
