//! HTTP PCM/WAV stream server output.
//!
//! Every accepted client gets a streaming WAV: a RIFF header whose size
//! fields are pinned to `i32::MAX` (the stream never ends), then chunked
//! 16-bit little-endian PCM straight off the mixer fan-out. Each client
//! owns a byte ring subscribed to the mixer, so a slow client only drops
//! its own audio.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::audio::ring::ByteRing;
use crate::config::HttpStreamConfig;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::mixer::Mixer;
use crate::outputs::{Output, OutputState, OutputStateCell};
use crate::source::VolumeCell;

/// Per-client buffered audio cap (~2 s of 48kHz stereo 16-bit).
const CLIENT_RING_BYTES: usize = 384_000;

/// How long `stop` waits for the listener before proceeding anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bookkeeping for one connected stream client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamClient {
    pub client_id: String,
    pub remote_endpoint: String,
    pub connected_at: DateTime<Utc>,
    pub bytes_sent: u64,
}

struct ClientEntry {
    remote_endpoint: String,
    connected_at: DateTime<Utc>,
    bytes_sent: Arc<AtomicU64>,
    ring: Arc<ByteRing>,
}

struct ServerShared {
    config: HttpStreamConfig,
    mixer: Arc<Mixer>,
    bus: Arc<EventBus>,
    state: Arc<OutputStateCell>,
    clients: Mutex<HashMap<String, ClientEntry>>,
    client_count: AtomicUsize,
}

impl ServerShared {
    fn register_client(&self, client_id: &str, remote: SocketAddr, ring: Arc<ByteRing>) -> Arc<AtomicU64> {
        let bytes_sent = Arc::new(AtomicU64::new(0));
        self.clients.lock().insert(
            client_id.to_string(),
            ClientEntry {
                remote_endpoint: remote.to_string(),
                connected_at: Utc::now(),
                bytes_sent: Arc::clone(&bytes_sent),
                ring,
            },
        );
        // The admission CAS in the handler already incremented the count
        let count = self.client_count.load(Ordering::Acquire);
        self.bus.set_stream_clients(count);
        self.bus.publish(EngineEvent::StreamClientConnected {
            client_id: client_id.to_string(),
            remote: remote.to_string(),
        });
        tracing::info!(client = client_id, remote = %remote, count, "stream client connected");
        bytes_sent
    }

    fn remove_client(&self, client_id: &str) {
        if self.clients.lock().remove(client_id).is_some() {
            let count = self.client_count.fetch_sub(1, Ordering::AcqRel) - 1;
            self.bus.set_stream_clients(count);
            self.mixer.remove_byte_tap(client_id);
            self.bus.publish(EngineEvent::StreamClientDisconnected {
                client_id: client_id.to_string(),
            });
            tracing::info!(client = client_id, count, "stream client disconnected");
        }
    }
}

/// Removes the client when its response body is dropped, however the
/// connection ended.
struct ClientGuard {
    shared: Arc<ServerShared>,
    client_id: String,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.shared.remove_client(&self.client_id);
    }
}

struct ServerHandle {
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct HttpStreamOutput {
    id: String,
    state: Arc<OutputStateCell>,
    shared: Arc<ServerShared>,
    runtime: tokio::runtime::Handle,
    server: Mutex<Option<ServerHandle>>,
    volume: Arc<VolumeCell>,
    muted: std::sync::atomic::AtomicBool,
}

impl HttpStreamOutput {
    /// Must be constructed inside a tokio runtime (the handle is captured
    /// for the accept loop and shutdown tasks).
    pub fn new(
        config: HttpStreamConfig,
        mixer: Arc<Mixer>,
        bus: Arc<EventBus>,
    ) -> Self {
        let state = Arc::new(OutputStateCell::new("output-http-stream", Arc::clone(&bus)));
        Self {
            id: "output-http-stream".to_string(),
            shared: Arc::new(ServerShared {
                config,
                mixer,
                bus,
                state: Arc::clone(&state),
                clients: Mutex::new(HashMap::new()),
                client_count: AtomicUsize::new(0),
            }),
            state,
            runtime: tokio::runtime::Handle::current(),
            server: Mutex::new(None),
            volume: Arc::new(VolumeCell::default()),
            muted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn connected_client_count(&self) -> usize {
        self.shared.client_count.load(Ordering::Acquire)
    }

    /// Snapshot of connected clients for the control surface.
    pub fn clients(&self) -> Vec<StreamClient> {
        self.shared
            .clients
            .lock()
            .iter()
            .map(|(id, entry)| StreamClient {
                client_id: id.clone(),
                remote_endpoint: entry.remote_endpoint.clone(),
                connected_at: entry.connected_at,
                bytes_sent: entry.bytes_sent.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// The bound address while streaming (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.local_addr)
    }
}

impl Output for HttpStreamOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "HTTP Stream"
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

        let addr = SocketAddr::from(([0, 0, 0, 0], self.shared.config.port));
        let listener = std::net::TcpListener::bind(addr)
            .and_then(|l| {
                l.set_nonblocking(true)?;
                Ok(l)
            })
            .map_err(|e| {
                let err = Error::external(format!("bind {addr}: {e}"));
                self.state.fail(&err);
                err
            })?;
        let local_addr = listener.local_addr().map_err(|e| Error::external(e.to_string()))?;

        let shutdown = Arc::new(Notify::new());
        let shared = Arc::clone(&self.shared);
        let path = self.shared.config.endpoint_path.clone();
        let shutdown_for_task = Arc::clone(&shutdown);
        let task = self.runtime.spawn(async move {
            let listener = match tokio::net::TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    shared.state.fail(&Error::external(e.to_string()));
                    return;
                }
            };

            let app = Router::new()
                .route(&path, get(stream_handler))
                .with_state(Arc::clone(&shared));

            tracing::info!(addr = %local_addr, path = %shared.config.endpoint_path, "stream server listening");
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_for_task.notified().await;
            });
            if let Err(e) = serve.await {
                shared.state.fail(&Error::external(e.to_string()));
            }
        });

        *self.server.lock() = Some(ServerHandle {
            shutdown,
            task,
            local_addr,
        });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.state.get() != OutputState::Streaming {
            tracing::warn!("stream server stop requested while not streaming");
            return Ok(());
        }
        self.state.transition(OutputState::Stopping, "stop")?;

        let Some(server) = self.server.lock().take() else {
            self.state.transition(OutputState::Stopped, "stop")?;
            return Ok(());
        };

        // Kick every client loose so their response bodies end
        for entry in self.shared.clients.lock().values() {
            entry.ring.close();
        }

        let state = Arc::clone(&self.state);
        server.shutdown.notify_waiters();
        self.runtime.spawn(async move {
            match tokio::time::timeout(SHUTDOWN_GRACE, server.task).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        "stream listener did not shut down within {:?}, proceeding",
                        SHUTDOWN_GRACE
                    );
                }
            }
            let _ = state.transition(OutputState::Stopped, "stop");
        });
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if self.state.get() == OutputState::Streaming {
            let _ = self.stop();
        }
        self.state.dispose();
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

/// Streaming WAV header with both size fields pinned open.
pub fn wav_header(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Bytes {
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let open_ended = i32::MAX as u32;

    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&open_ended.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // PCM
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits_per_sample.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&open_ended.to_le_bytes());
    Bytes::from(header)
}

struct BodyState {
    ring: Arc<ByteRing>,
    header: Option<Bytes>,
    bytes_sent: Arc<AtomicU64>,
    _guard: ClientGuard,
}

async fn stream_handler(
    State(shared): State<Arc<ServerShared>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    // Admission control before any accounting
    let max = shared.config.max_concurrent_clients;
    let admitted = shared
        .client_count
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            (count < max).then_some(count + 1)
        })
        .is_ok();
    if !admitted {
        tracing::warn!(%remote, "stream client rejected: at capacity ({max})");
        return (StatusCode::SERVICE_UNAVAILABLE, "stream at capacity").into_response();
    }

    let client_id = uuid::Uuid::new_v4().to_string();
    let ring = Arc::new(ByteRing::new(CLIENT_RING_BYTES));
    let bytes_sent = shared.register_client(&client_id, remote, Arc::clone(&ring));
    shared.mixer.add_byte_tap(&client_id, Arc::clone(&ring));

    let header = wav_header(shared.config.sample_rate, shared.config.channels, 16);
    let guard = ClientGuard {
        shared: Arc::clone(&shared),
        client_id,
    };
    let state = BodyState {
        ring,
        header: Some(header),
        bytes_sent,
        _guard: guard,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if let Some(header) = state.header.take() {
            state.bytes_sent.fetch_add(header.len() as u64, Ordering::Relaxed);
            return Some((Ok::<Bytes, std::convert::Infallible>(header), state));
        }
        match state.ring.recv().await {
            Some(chunk) => {
                state.bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Some((Ok(chunk), state))
            }
            None => None,
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, shared.config.content_type.clone())
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::ducking::DuckingEngine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_wav_header_layout() {
        let header = wav_header(48_000, 2, 16);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[12..16], b"fmt ");
        assert_eq!(&header[36..40], b"data");
        // Both size fields are pinned to i32::MAX
        let riff_size = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let data_size = u32::from_le_bytes(header[40..44].try_into().unwrap());
        assert_eq!(riff_size, i32::MAX as u32);
        assert_eq!(data_size, i32::MAX as u32);
        // 48kHz stereo 16-bit byte rate
        let byte_rate = u32::from_le_bytes(header[28..32].try_into().unwrap());
        assert_eq!(byte_rate, 192_000);
    }

    async fn connect_and_read(addr: SocketAddr, path: &str) -> (u16, Vec<u8>) {
        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        socket.write_all(request.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while collected.len() < 512 && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), socket.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        let status = std::str::from_utf8(&collected[..collected.len().min(16)])
            .ok()
            .and_then(|s| s.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        (status, collected)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capacity_and_wav_delivery() {
        let (mixer, _notices) = Mixer::spawn(Arc::new(DuckingEngine::default()));
        let config = HttpStreamConfig {
            port: 0,
            max_concurrent_clients: 2,
            ..Default::default()
        };
        let output = HttpStreamOutput::new(config, Arc::new(mixer), Arc::new(EventBus::new()));
        output.initialize().unwrap();
        output.start().unwrap();
        let addr = output.local_addr().unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        // Two clients are admitted and receive the RIFF header
        let (status1, body1) = connect_and_read(addr, "/stream/audio").await;
        assert_eq!(status1, 200);
        let body_text = body1.windows(4).any(|w| w == b"RIFF");
        assert!(body_text, "first client did not receive a WAV header");

        let mut c1 = tokio::net::TcpStream::connect(addr).await.unwrap();
        c1.write_all(b"GET /stream/audio HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut c2 = tokio::net::TcpStream::connect(addr).await.unwrap();
        c2.write_all(b"GET /stream/audio HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        // Give the server a moment to admit both
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while output.connected_client_count() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(output.connected_client_count(), 2);

        // A third client is refused with 503 and never counted
        let (status3, _) = connect_and_read(addr, "/stream/audio").await;
        assert_eq!(status3, 503);
        assert_eq!(output.connected_client_count(), 2);

        output.stop().unwrap();
        output.dispose().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_when_not_streaming_is_warning_success() {
        let (mixer, _notices) = Mixer::spawn(Arc::new(DuckingEngine::default()));
        let output = HttpStreamOutput::new(
            HttpStreamConfig::default(),
            Arc::new(mixer),
            Arc::new(EventBus::new()),
        );
        output.initialize().unwrap();
        output.stop().unwrap();
        assert_eq!(output.state(), OutputState::Ready);
    }
}
