//! Auricle - a networked multi-source audio appliance.
//!
//! Mixes primary sources (files, SDR radio, USB line-in, streaming) with
//! short-lived event overlays, ducks the background while events play,
//! and fans the mixed 48 kHz bus out to the local device, an HTTP WAV
//! stream and Google Cast receivers. Control is REST; telemetry
//! (spectrum/levels/waveform, queue, radio state) is pushed over
//! WebSocket.

pub mod api;
pub mod audio;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod events;
pub mod mixer;
pub mod orchestrator;
pub mod outputs;
pub mod source;
pub mod stats;
#[cfg(test)]
pub mod test_utils;
pub mod viz;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::{Mutex, RwLock};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::api::{AppState, OutputSet};
use crate::devices::DeviceManager;
use crate::events::EventBus;
use crate::mixer::Mixer;
use crate::mixer::ducking::{DuckConfig, DuckingEngine, EventCoordinator};
use crate::orchestrator::{Orchestrator, SourceFactory};
use crate::outputs::Output;
use crate::outputs::cast::{CastOutput, TcpProbeTransport};
use crate::outputs::http_stream::HttpStreamOutput;
use crate::outputs::local::LocalOutput;
use crate::stats::{BufferLayer, LogBuffer, SystemMonitor};
use crate::viz::VisualizationService;

#[derive(Debug, Parser)]
#[command(name = "auricle", about = "Networked multi-source audio appliance")]
struct Cli {
    /// Control API listen port
    #[arg(long, default_value_t = 8080, env = "AURICLE_PORT")]
    port: u16,

    /// Config file path (defaults to the OS config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "AURICLE_DB")]
    database: Option<PathBuf>,

    /// Media library root (overrides the config file)
    #[arg(long, env = "AURICLE_LIBRARY")]
    library: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // Initialize logging: stderr plus the in-memory ring behind the
    // /api/system/logs endpoint
    let logs = LogBuffer::new();
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(BufferLayer::new(Arc::clone(&logs)))
        .with(EnvFilter::from_default_env().add_directive("auricle=info".parse()?))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args, logs))
}

async fn run(args: Cli, logs: Arc<LogBuffer>) -> anyhow::Result<()> {
    let mut config = config::load(args.config.as_deref());
    if let Some(library) = args.library {
        config.library.root = library;
    }
    let library_root = config.library.root.clone();
    if !library_root.exists() {
        tracing::warn!(root = %library_root.display(), "library root does not exist");
    }

    // Persistence
    let db_url = db::db_url(args.database.as_deref());
    let pool = db::init_db(&db_url).await?;
    let restored_prefs = db::load_source_prefs(&pool).await.unwrap_or_default();
    tracing::info!(
        "database ready at {db_url} ({} source prefs restored)",
        restored_prefs.len()
    );

    // Core runtime
    let bus = Arc::new(EventBus::new());
    let ducking = Arc::new(DuckingEngine::new(DuckConfig {
        percentage: config.audio.duck_percentage,
        attack_ms: config.audio.duck_attack_ms,
        release_ms: config.audio.duck_release_ms,
        policy: config.audio.duck_policy,
    }));
    let (mixer, notices) = Mixer::spawn(Arc::clone(&ducking));
    let mixer = Arc::new(mixer);
    let coordinator = Arc::new(EventCoordinator::new(ducking, Arc::clone(&bus)));
    let devices = Arc::new(DeviceManager::new());

    // Preference writes flow through a channel so dispose never blocks
    // on the database
    let (prefs_tx, prefs_rx) = crossbeam_channel::unbounded::<db::SourcePrefs>();
    spawn_prefs_writer(pool.clone(), prefs_rx);

    let factory = SourceFactory {
        bus: Arc::clone(&bus),
        devices: Arc::clone(&devices),
        library_root: library_root.clone(),
        streaming_backend: None,
        streaming_catalog: None,
        sdr_frontend: Box::new(|| Box::new(source::radio::OfflineFrontend::new())),
        restored_prefs: Mutex::new(restored_prefs),
        prefs_tx: Some(prefs_tx),
    };
    let catalog = factory.streaming_catalog.clone();
    let orchestrator = Orchestrator::new(
        Arc::clone(&bus),
        Arc::clone(&mixer),
        coordinator,
        factory,
        notices,
    );

    // Visualization taps the mixed bus
    let viz = Arc::new(VisualizationService::spawn(
        config.visualizer.clone(),
        &mixer,
    ));

    // Automatic play-history recording from metadata changes
    spawn_history_recorder(pool.clone(), Arc::clone(&bus), Arc::clone(&orchestrator));

    // Outputs
    let outputs = start_outputs(&config, &mixer, &devices, &bus);

    // Default source
    if !config.audio.default_source.is_empty() {
        match orchestrator.select_source(&config.audio.default_source, &HashMap::new()) {
            Ok(source) => tracing::info!(source = source.id(), "default source ready"),
            Err(e) => tracing::warn!("default source unavailable: {e}"),
        }
    }

    // Control surface
    let push = api::push::PushHub::new(Arc::clone(&bus));
    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        devices,
        config: RwLock::new(config),
        pool,
        monitor: Arc::new(SystemMonitor::new()),
        logs,
        viz,
        catalog,
        outputs,
        push,
        library_root,
    });

    let listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], args.port))).await?;
    tracing::info!("control surface listening on {}", listener.local_addr()?);

    let app = api::router(Arc::clone(&state));
    let shutdown_state = Arc::clone(&state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        shutdown_state.stop_outputs();
        shutdown_state.orchestrator.dispose_all();
    })
    .await?;

    Ok(())
}

/// Start the outputs the configuration enables. A failing output never
/// stops the appliance; it logs and stays in Error.
fn start_outputs(
    config: &config::Config,
    mixer: &Arc<Mixer>,
    devices: &Arc<DeviceManager>,
    bus: &Arc<EventBus>,
) -> OutputSet {
    let local = config.output.local.enabled.then(|| {
        let output = Arc::new(LocalOutput::new(
            Arc::clone(mixer),
            Arc::clone(devices),
            Arc::clone(bus),
        ));
        if !config.output.local.preferred_device_id.is_empty() {
            if let Err(e) = devices.set_output(&config.output.local.preferred_device_id) {
                tracing::warn!("preferred output device unavailable: {e}");
            }
        }
        let _ = output.set_volume(config.output.local.default_volume.clamp(0.0, 1.0));
        if let Err(e) = output.initialize().and_then(|()| output.start()) {
            tracing::error!("local output failed to start: {e}");
        }
        output
    });

    let http_stream = config.output.http_stream.enabled.then(|| {
        let output = Arc::new(HttpStreamOutput::new(
            config.output.http_stream.clone(),
            Arc::clone(mixer),
            Arc::clone(bus),
        ));
        if let Err(e) = output.initialize().and_then(|()| output.start()) {
            tracing::error!("http stream output failed to start: {e}");
        }
        output
    });

    let cast = config.output.google_cast.enabled.then(|| {
        let stream_url = if config.output.google_cast.stream_url.is_empty() {
            format!(
                "http://0.0.0.0:{}{}",
                config.output.http_stream.port, config.output.http_stream.endpoint_path
            )
        } else {
            config.output.google_cast.stream_url.clone()
        };
        let output = Arc::new(CastOutput::new(
            config.output.google_cast.clone(),
            stream_url,
            config.output.http_stream.content_type.clone(),
            Arc::new(TcpProbeTransport::new()),
            Arc::clone(bus),
        ));
        if let Err(e) = output.initialize() {
            tracing::error!("cast output failed to initialize: {e}");
            return output;
        }

        // Discover receivers in the background; bind to the first found
        let discovery = Arc::clone(&output);
        let timeout = std::time::Duration::from_secs(config.output.google_cast.discovery_timeout_s);
        std::thread::Builder::new()
            .name("cast-discovery".to_string())
            .spawn(move || match outputs::cast::discover(timeout) {
                Ok(found) if !found.is_empty() => {
                    let device = found[0].clone();
                    tracing::info!(device = %device.friendly_name, "cast receiver found");
                    if let Err(e) = discovery.connect(device).and_then(|()| discovery.start()) {
                        tracing::warn!("cast session failed: {e}");
                    }
                }
                Ok(_) => tracing::info!("no cast receivers found"),
                Err(e) => tracing::warn!("cast discovery failed: {e}"),
            })
            .expect("failed to spawn cast discovery");
        output
    });

    OutputSet {
        local,
        http_stream,
        cast,
    }
}

/// Drain preference updates onto the database from a plain thread.
fn spawn_prefs_writer(
    pool: sqlx::SqlitePool,
    rx: crossbeam_channel::Receiver<db::SourcePrefs>,
) {
    std::thread::Builder::new()
        .name("prefs-writer".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build prefs runtime");
            while let Ok(prefs) = rx.recv() {
                if let Err(e) = runtime.block_on(db::save_source_prefs(&pool, &prefs)) {
                    tracing::warn!(source = %prefs.source_id, "failed to persist prefs: {e}");
                }
            }
        })
        .expect("failed to spawn prefs writer");
}

/// Record history entries when a playing primary's metadata changes.
/// Duplicate suppression in the history module keeps retries quiet.
fn spawn_history_recorder(
    pool: sqlx::SqlitePool,
    bus: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
) {
    let rx = bus.subscribe();
    std::thread::Builder::new()
        .name("history-recorder".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build history runtime");
            while let Ok(event) = rx.recv() {
                let events::EngineEvent::MetadataChanged { source_id } = event else {
                    continue;
                };
                let Some(primary) = orchestrator.primary() else {
                    continue;
                };
                if primary.id() != source_id
                    || primary.state() != source::SourceState::Playing
                {
                    continue;
                }
                let meta = primary.metadata();
                let title = meta.text(source::MetadataKey::Title);
                if title.is_none() {
                    continue;
                }
                let record = db::history::HistoryRecord {
                    source: match primary.kind() {
                        source::SourceKind::Turntable => db::history::HistorySource::Vinyl,
                        source::SourceKind::SdrRadio => db::history::HistorySource::Radio,
                        source::SourceKind::Streaming => db::history::HistorySource::Streaming,
                        _ => db::history::HistorySource::File,
                    },
                    metadata_source: meta
                        .text(source::MetadataKey::MetadataSource)
                        .map(str::to_string),
                    title: title.map(str::to_string),
                    artist: meta.text(source::MetadataKey::Artist).map(str::to_string),
                    album: meta.text(source::MetadataKey::Album).map(str::to_string),
                    duration_seconds: primary.duration().map(|d| d.as_secs_f64()),
                };
                match runtime.block_on(db::history::record(&pool, &record)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == error::ErrorKind::Conflict => {}
                    Err(e) => tracing::debug!("history record failed: {e}"),
                }
            }
        })
        .expect("failed to spawn history recorder");
}
