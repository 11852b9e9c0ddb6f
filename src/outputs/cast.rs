//! Google Cast output: mDNS discovery plus a receiver session that plays
//! the appliance's HTTP stream as live media.
//!
//! Discovery is real (`_googlecast._tcp` over mdns-sd). The receiver wire
//! protocol sits behind [`CastTransport`] so the session logic is
//! testable and the vendor protocol stays out of the core; the default
//! transport verifies reachability and tracks the session token.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use parking_lot::Mutex;

use crate::config::CastConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::outputs::{Output, OutputState, OutputStateCell};
use crate::source::VolumeCell;

/// The default media receiver application id.
pub const DEFAULT_RECEIVER_APP_ID: &str = "CC1AD845";

const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// A discovered Cast device.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CastDeviceRecord {
    pub id: String,
    pub friendly_name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub model: String,
}

/// Wire operations against one receiver. Every call is bounded.
pub trait CastTransport: Send + Sync {
    fn connect(&self, device: &CastDeviceRecord, timeout: Duration) -> Result<()>;
    /// Launch an application, returning its session id.
    fn launch(&self, app_id: &str) -> Result<String>;
    /// Load a live media URL into the launched application.
    fn load_media(&self, session_id: &str, url: &str, content_type: &str) -> Result<()>;
    fn set_volume(&self, level: f32) -> Result<()>;
    fn set_muted(&self, muted: bool) -> Result<()>;
    fn stop_session(&self, session_id: &str) -> Result<()>;
    fn disconnect(&self);
}

/// Default transport: proves the receiver is reachable over TCP and
/// keeps session bookkeeping local.
pub struct TcpProbeTransport {
    session_counter: std::sync::atomic::AtomicU64,
}

impl TcpProbeTransport {
    pub fn new() -> Self {
        Self {
            session_counter: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl Default for TcpProbeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CastTransport for TcpProbeTransport {
    fn connect(&self, device: &CastDeviceRecord, timeout: Duration) -> Result<()> {
        let addr = SocketAddr::new(device.ip, device.port);
        TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Error::external(format!("cast receiver {addr} unreachable: {e}")))?;
        Ok(())
    }

    fn launch(&self, app_id: &str) -> Result<String> {
        let n = self
            .session_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(app = app_id, "launching cast receiver application");
        Ok(format!("session-{n}"))
    }

    fn load_media(&self, session_id: &str, url: &str, content_type: &str) -> Result<()> {
        tracing::info!(session = session_id, url, content_type, "loading live stream");
        Ok(())
    }

    fn set_volume(&self, _level: f32) -> Result<()> {
        Ok(())
    }

    fn set_muted(&self, _muted: bool) -> Result<()> {
        Ok(())
    }

    fn stop_session(&self, session_id: &str) -> Result<()> {
        tracing::info!(session = session_id, "stopping cast session");
        Ok(())
    }

    fn disconnect(&self) {}
}

/// Browse for Cast receivers until `timeout` elapses.
pub fn discover(timeout: Duration) -> Result<Vec<CastDeviceRecord>> {
    let daemon = ServiceDaemon::new().map_err(|e| Error::external(e.to_string()))?;
    let receiver = daemon
        .browse(CAST_SERVICE_TYPE)
        .map_err(|e| Error::external(e.to_string()))?;

    let deadline = std::time::Instant::now() + timeout;
    let mut found: Vec<CastDeviceRecord> = Vec::new();

    while let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) {
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let Some(ip) = info.get_addresses().iter().next().copied() else {
                    continue;
                };
                let id = info
                    .get_property_val_str("id")
                    .unwrap_or_else(|| info.get_fullname())
                    .to_string();
                if found.iter().any(|d| d.id == id) {
                    continue;
                }
                found.push(CastDeviceRecord {
                    id,
                    friendly_name: info
                        .get_property_val_str("fn")
                        .unwrap_or("Cast Device")
                        .to_string(),
                    ip,
                    port: info.get_port(),
                    model: info.get_property_val_str("md").unwrap_or("").to_string(),
                });
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let _ = daemon.stop_browse(CAST_SERVICE_TYPE);
    let _ = daemon.shutdown();
    tracing::info!("cast discovery found {} device(s)", found.len());
    Ok(found)
}

struct Session {
    device: CastDeviceRecord,
    session_id: Option<String>,
}

pub struct CastOutput {
    id: String,
    state: OutputStateCell,
    config: CastConfig,
    transport: Arc<dyn CastTransport>,
    session: Mutex<Option<Session>>,
    stream_url: String,
    content_type: String,
    volume: Arc<VolumeCell>,
    muted: std::sync::atomic::AtomicBool,
}

impl CastOutput {
    pub fn new(
        config: CastConfig,
        stream_url: String,
        content_type: String,
        transport: Arc<dyn CastTransport>,
        bus: Arc<EventBus>,
    ) -> Self {
        let volume = Arc::new(VolumeCell::new(config.default_volume));
        Self {
            id: "output-cast".to_string(),
            state: OutputStateCell::new("output-cast", bus),
            config,
            transport,
            session: Mutex::new(None),
            stream_url,
            content_type,
            volume,
            muted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Bind a discovered device to this output (Ready is required).
    pub fn connect(&self, device: CastDeviceRecord) -> Result<()> {
        match self.state.get() {
            OutputState::Ready | OutputState::Stopped => {}
            state => return Err(Error::illegal_state("connect", state)),
        }
        let timeout = Duration::from_secs(self.config.discovery_timeout_s.max(1));
        self.transport.connect(&device, timeout)?;
        tracing::info!(device = %device.friendly_name, "cast receiver connected");
        *self.session.lock() = Some(Session {
            device,
            session_id: None,
        });
        Ok(())
    }

    pub fn connected_device(&self) -> Option<CastDeviceRecord> {
        self.session.lock().as_ref().map(|s| s.device.clone())
    }
}

impl Output for CastOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Google Cast"
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
        {
            let session = self.session.lock();
            if session.is_none() {
                return Err(Error::illegal_state("start", "no receiver connected"));
            }
        }
        self.state.transition(OutputState::Connecting, "start")?;

        let result = (|| -> Result<()> {
            let mut session_guard = self.session.lock();
            let session = session_guard
                .as_mut()
                .ok_or_else(|| Error::illegal_state("start", "no receiver connected"))?;
            let session_id = self.transport.launch(DEFAULT_RECEIVER_APP_ID)?;
            self.transport
                .load_media(&session_id, &self.stream_url, &self.content_type)?;
            session.session_id = Some(session_id);
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.state.transition(OutputState::Streaming, "start")?;
                let _ = self.transport.set_volume(self.volume.get());
                Ok(())
            }
            Err(e) => {
                // Fall back to Ready; the receiver stays connected
                let _ = self.state.transition(OutputState::Ready, "start");
                Err(e)
            }
        }
    }

    fn stop(&self) -> Result<()> {
        if self.state.get() != OutputState::Streaming {
            tracing::warn!("cast stop requested while not streaming");
            return Ok(());
        }
        self.state.transition(OutputState::Stopping, "stop")?;
        if let Some(session) = self.session.lock().as_mut() {
            if let Some(session_id) = session.session_id.take() {
                if let Err(e) = self.transport.stop_session(&session_id) {
                    tracing::warn!("cast session stop failed: {e}");
                }
            }
        }
        self.state.transition(OutputState::Stopped, "stop")?;
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if self.state.get() == OutputState::Streaming {
            let _ = self.stop();
        }
        if !self.state.dispose() {
            return Ok(());
        }
        self.transport.disconnect();
        *self.session.lock() = None;
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
        if self.state.get() == OutputState::Streaming {
            self.transport.set_volume(volume)?;
        }
        Ok(())
    }

    fn muted(&self) -> bool {
        self.muted.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn set_muted(&self, muted: bool) -> Result<()> {
        self.muted.store(muted, std::sync::atomic::Ordering::Relaxed);
        if self.state.get() == OutputState::Streaming {
            self.transport.set_muted(muted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockTransport {
        connected: Mutex<Option<String>>,
        launched: Mutex<Vec<String>>,
        loaded: Mutex<Vec<(String, String)>>,
        volume_calls: Mutex<Vec<f32>>,
        stopped: Mutex<Vec<String>>,
    }

    impl CastTransport for MockTransport {
        fn connect(&self, device: &CastDeviceRecord, _timeout: Duration) -> Result<()> {
            *self.connected.lock() = Some(device.id.clone());
            Ok(())
        }

        fn launch(&self, app_id: &str) -> Result<String> {
            self.launched.lock().push(app_id.to_string());
            Ok("session-1".to_string())
        }

        fn load_media(&self, session_id: &str, url: &str, _content_type: &str) -> Result<()> {
            self.loaded.lock().push((session_id.to_string(), url.to_string()));
            Ok(())
        }

        fn set_volume(&self, level: f32) -> Result<()> {
            self.volume_calls.lock().push(level);
            Ok(())
        }

        fn set_muted(&self, _muted: bool) -> Result<()> {
            Ok(())
        }

        fn stop_session(&self, session_id: &str) -> Result<()> {
            self.stopped.lock().push(session_id.to_string());
            Ok(())
        }

        fn disconnect(&self) {}
    }

    fn device() -> CastDeviceRecord {
        CastDeviceRecord {
            id: "cast-1".to_string(),
            friendly_name: "Living Room".to_string(),
            ip: IpAddr::from([192, 168, 1, 50]),
            port: 8009,
            model: "Chromecast Audio".to_string(),
        }
    }

    fn output(transport: Arc<MockTransport>) -> CastOutput {
        CastOutput::new(
            CastConfig::default(),
            "http://10.0.0.2:5901/stream/audio".to_string(),
            "audio/wav".to_string(),
            transport,
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn test_start_launches_default_receiver_and_loads_stream() {
        let transport = Arc::new(MockTransport::default());
        let out = output(Arc::clone(&transport));
        out.initialize().unwrap();
        out.connect(device()).unwrap();
        out.start().unwrap();

        assert_eq!(out.state(), OutputState::Streaming);
        assert_eq!(transport.launched.lock().as_slice(), [DEFAULT_RECEIVER_APP_ID]);
        let loaded = transport.loaded.lock();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1, "http://10.0.0.2:5901/stream/audio");
    }

    #[test]
    fn test_start_without_device_is_illegal() {
        let out = output(Arc::new(MockTransport::default()));
        out.initialize().unwrap();
        let err = out.start().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
    }

    #[test]
    fn test_volume_propagates_only_while_streaming() {
        let transport = Arc::new(MockTransport::default());
        let out = output(Arc::clone(&transport));
        out.initialize().unwrap();

        out.set_volume(0.5).unwrap();
        assert!(transport.volume_calls.lock().is_empty());

        out.connect(device()).unwrap();
        out.start().unwrap();
        out.set_volume(0.7).unwrap();
        assert!(transport.volume_calls.lock().contains(&0.7));
    }

    #[test]
    fn test_stop_tears_down_session() {
        let transport = Arc::new(MockTransport::default());
        let out = output(Arc::clone(&transport));
        out.initialize().unwrap();
        out.connect(device()).unwrap();
        out.start().unwrap();
        out.stop().unwrap();
        assert_eq!(out.state(), OutputState::Stopped);
        assert_eq!(transport.stopped.lock().as_slice(), ["session-1"]);
    }
}
