//! REST control surface.
//!
//! Thin handlers over the orchestrator, device manager, persistence and
//! diagnostics modules; every error funnels through the kind-to-status
//! mapping in [`dto::ApiError`].

pub mod dto;
pub mod push;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use sqlx::sqlite::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use walkdir::WalkDir;

use crate::config::Config;
use crate::db::{history, presets};
use crate::devices::DeviceManager;
use crate::error::Error;
use crate::orchestrator::{Orchestrator, PlaybackUpdate, available_sources};
use crate::outputs::Output;
use crate::outputs::cast::CastOutput;
use crate::outputs::http_stream::HttpStreamOutput;
use crate::outputs::local::LocalOutput;
use crate::source::decoder::is_supported_extension;
use crate::source::queue::RepeatMode;
use crate::source::radio::Band;
use crate::source::streaming::{SearchType, StreamingCatalog};
use crate::stats::{LogBuffer, SystemMonitor};
use crate::viz::VisualizationService;
use dto::*;

/// The configured output sinks.
pub struct OutputSet {
    pub local: Option<Arc<LocalOutput>>,
    pub http_stream: Option<Arc<HttpStreamOutput>>,
    pub cast: Option<Arc<CastOutput>>,
}

/// Shared state behind every handler.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub devices: Arc<DeviceManager>,
    pub config: RwLock<Config>,
    pub pool: SqlitePool,
    pub monitor: Arc<SystemMonitor>,
    pub logs: Arc<LogBuffer>,
    pub viz: Arc<VisualizationService>,
    pub catalog: Option<Arc<dyn StreamingCatalog>>,
    pub outputs: OutputSet,
    pub push: Arc<push::PushHub>,
    pub library_root: PathBuf,
}

type S = State<Arc<AppState>>;

/// Build the full router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Playback
        .route("/api/playback", get(get_playback).post(update_playback))
        .route("/api/nowplaying", get(now_playing))
        // Volume
        .route("/api/volume", get(get_volume).post(set_volume))
        .route("/api/volume/mute", post(toggle_mute))
        .route("/api/volume/balance", post(set_balance))
        // Sources
        .route("/api/sources/available", get(list_available_sources))
        .route("/api/sources/active", get(list_active_sources))
        .route("/api/sources/primary", get(get_primary_source))
        .route("/api/sources/select", post(select_source))
        // Queue
        .route("/api/queue", get(get_queue).post(add_to_queue))
        .route("/api/queue/clear", post(clear_queue))
        .route("/api/queue/move", post(move_queue_item))
        .route("/api/queue/jump", post(jump_to_index))
        .route("/api/queue/next", post(queue_next))
        .route("/api/queue/previous", post(queue_previous))
        .route("/api/queue/shuffle", post(set_shuffle))
        .route("/api/queue/repeat", post(set_repeat))
        .route("/api/queue/:index", delete(remove_from_queue))
        // Files
        .route("/api/files", get(list_files))
        .route("/api/files/play", post(play_file))
        .route("/api/files/enqueue", post(enqueue_files))
        // Radio
        .route("/api/radio", get(radio_state))
        .route("/api/radio/frequency", post(set_frequency))
        .route("/api/radio/band", post(set_band))
        .route("/api/radio/step", post(set_step))
        .route("/api/radio/scan/start", post(scan_start))
        .route("/api/radio/scan/stop", post(scan_stop))
        .route("/api/radio/equalizer", post(set_equalizer))
        .route("/api/radio/device-volume", post(set_device_volume))
        .route("/api/radio/gain", post(set_gain))
        .route("/api/radio/auto-gain", post(set_auto_gain))
        .route("/api/radio/presets", get(list_presets).post(create_preset))
        .route("/api/radio/presets/:id", delete(delete_preset))
        // Streaming
        .route("/api/streaming/search", get(streaming_search))
        .route("/api/streaming/categories", get(streaming_categories))
        .route(
            "/api/streaming/categories/:id/playlists",
            get(streaming_category_playlists),
        )
        .route("/api/streaming/playlists", get(streaming_user_playlists))
        .route("/api/streaming/playlists/:id", get(streaming_playlist_details))
        .route("/api/streaming/play", post(streaming_play))
        // Devices
        .route("/api/devices/outputs", get(list_output_devices))
        .route("/api/devices/inputs", get(list_input_devices))
        .route("/api/devices/outputs/default", get(default_output_device))
        .route("/api/devices/output", post(set_output_device))
        .route("/api/devices/refresh", post(refresh_devices))
        .route("/api/devices/usb", get(list_usb_reservations))
        .route("/api/devices/usb/check", get(check_usb_port))
        // Outputs
        .route("/api/outputs", get(outputs_status))
        // Events (overlay chimes / notifications)
        .route("/api/events", post(trigger_event))
        .route("/api/events/:id", delete(cancel_event))
        // Track identification callback (external fingerprinting service)
        .route("/api/identify", post(identify_track))
        // System
        .route("/api/system/stats", get(system_stats))
        .route("/api/system/logs", get(system_logs))
        // History
        .route("/api/history", post(record_history))
        .route("/api/history/recent", get(history_recent))
        .route("/api/history/today", get(history_today))
        .route("/api/history/range", get(history_range))
        .route("/api/history/source/:source", get(history_by_source))
        .route("/api/history/statistics", get(history_statistics))
        .route("/api/history/:id", delete(delete_history))
        // Configuration
        .route("/api/config", get(get_config).put(update_config))
        .route("/api/config/audio", get(get_audio_config))
        .route("/api/config/visualizer", get(get_visualizer_config))
        .route("/api/config/output", get(get_output_config))
        // Visualization pull endpoints
        .route("/api/visualization/spectrum", get(viz_spectrum))
        .route("/api/visualization/levels", get(viz_levels))
        .route("/api/visualization/waveform", get(viz_waveform))
        // Push hub
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---- playback ----

async fn get_playback(State(state): S) -> impl IntoResponse {
    Json(state.orchestrator.playback_state())
}

async fn update_playback(
    State(state): S,
    Json(update): Json<PlaybackUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.update_playback(&update)?))
}

async fn now_playing(State(state): S) -> impl IntoResponse {
    Json(state.orchestrator.now_playing())
}

// ---- volume ----

fn volume_dto(state: &AppState) -> VolumeDto {
    let shared = state.orchestrator.mixer().shared();
    VolumeDto {
        volume: shared.master_volume.get(),
        is_muted: shared.muted(),
        balance: shared.master_balance.get(),
    }
}

async fn get_volume(State(state): S) -> impl IntoResponse {
    Json(volume_dto(&state))
}

async fn set_volume(
    State(state): S,
    Json(request): Json<SetVolumeRequest>,
) -> ApiResult<impl IntoResponse> {
    if !(0.0..=1.0).contains(&request.volume) {
        return Err(Error::invalid_argument("volume must be in [0,1]").into());
    }
    state.orchestrator.mixer().shared().master_volume.set(request.volume);
    Ok(Json(volume_dto(&state)))
}

async fn toggle_mute(State(state): S) -> impl IntoResponse {
    let shared = state.orchestrator.mixer().shared();
    shared.set_muted(!shared.muted());
    Json(volume_dto(&state))
}

async fn set_balance(
    State(state): S,
    Json(request): Json<SetBalanceRequest>,
) -> ApiResult<impl IntoResponse> {
    if !(-1.0..=1.0).contains(&request.balance) {
        return Err(Error::invalid_argument("balance must be in [-1,1]").into());
    }
    state.orchestrator.mixer().shared().master_balance.set(request.balance);
    Ok(Json(volume_dto(&state)))
}

// ---- sources ----

async fn list_available_sources() -> impl IntoResponse {
    Json(available_sources())
}

async fn list_active_sources(State(state): S) -> impl IntoResponse {
    let sources: Vec<AudioSourceDto> = state
        .orchestrator
        .active_sources()
        .iter()
        .map(|s| AudioSourceDto::from_source(s.as_ref()))
        .collect();
    Json(sources)
}

async fn get_primary_source(State(state): S) -> ApiResult<impl IntoResponse> {
    let primary = state.orchestrator.require_primary()?;
    Ok(Json(AudioSourceDto::from_source(primary.as_ref())))
}

async fn select_source(
    State(state): S,
    Json(request): Json<SelectSourceRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = state
        .orchestrator
        .select_source(&request.source_type, &request.config)?;
    Ok(Json(AudioSourceDto::from_source(source.as_ref())))
}

// ---- queue ----

async fn get_queue(State(state): S) -> ApiResult<impl IntoResponse> {
    let items: Vec<QueueItemDto> = state
        .orchestrator
        .queue()?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(items))
}

async fn add_to_queue(
    State(state): S,
    Json(request): Json<AddToQueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let item = state
        .orchestrator
        .add_to_queue(&request.identifier, request.position)?;
    Ok(Json(QueueItemDto::from(item)))
}

async fn remove_from_queue(State(state): S, Path(index): Path<usize>) -> ApiResult<impl IntoResponse> {
    state.orchestrator.remove_from_queue(index)?;
    Ok(Json(serde_json::json!({"removed": index})))
}

async fn clear_queue(State(state): S) -> ApiResult<impl IntoResponse> {
    state.orchestrator.clear_queue()?;
    Ok(Json(serde_json::json!({"cleared": true})))
}

async fn move_queue_item(
    State(state): S,
    Json(request): Json<MoveQueueItemRequest>,
) -> ApiResult<impl IntoResponse> {
    state.orchestrator.move_queue_item(request.from, request.to)?;
    Ok(Json(serde_json::json!({"moved": {"from": request.from, "to": request.to}})))
}

async fn jump_to_index(
    State(state): S,
    Json(request): Json<JumpRequest>,
) -> ApiResult<impl IntoResponse> {
    state.orchestrator.jump_to_index(request.index)?;
    Ok(Json(serde_json::json!({"current": request.index})))
}

async fn queue_next(State(state): S) -> ApiResult<impl IntoResponse> {
    state.orchestrator.next()?;
    Ok(Json(state.orchestrator.playback_state()))
}

async fn queue_previous(State(state): S) -> ApiResult<impl IntoResponse> {
    state.orchestrator.previous()?;
    Ok(Json(state.orchestrator.playback_state()))
}

async fn set_shuffle(
    State(state): S,
    Json(request): Json<ShuffleRequest>,
) -> ApiResult<impl IntoResponse> {
    state.orchestrator.set_shuffle(request.enabled)?;
    Ok(Json(state.orchestrator.playback_state()))
}

async fn set_repeat(
    State(state): S,
    Json(request): Json<RepeatRequest>,
) -> ApiResult<impl IntoResponse> {
    state.orchestrator.set_repeat(RepeatMode::parse(&request.mode)?)?;
    Ok(Json(state.orchestrator.playback_state()))
}

// ---- files ----

async fn list_files(
    State(state): S,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.path.split(['/', '\\']).any(|part| part == "..") {
        return Err(Error::invalid_argument("path may not contain '..'").into());
    }
    let root = state.library_root.join(query.path.trim_start_matches(['/', '\\']));
    if !root.exists() {
        return Err(Error::not_found(root.display().to_string()).into());
    }

    let depth = if query.recursive { usize::MAX } else { 1 };
    let mut files: Vec<FileInfoDto> = WalkDir::new(&root)
        .min_depth(1)
        .max_depth(depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() || is_supported_extension(e.path()))
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            FileInfoDto {
                path: e
                    .path()
                    .strip_prefix(&state.library_root)
                    .unwrap_or(e.path())
                    .to_string_lossy()
                    .to_string(),
                name: e.file_name().to_string_lossy().to_string(),
                is_dir: e.file_type().is_dir(),
                size_bytes: size,
            }
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(Json(files))
}

/// The file source via the primary slot, selecting it if necessary.
fn file_source(state: &AppState) -> ApiResult<Arc<dyn crate::source::AudioSource>> {
    let primary = state.orchestrator.primary();
    match primary {
        Some(p) if p.as_files().is_some() => Ok(p),
        _ => Ok(state
            .orchestrator
            .select_source("file", &std::collections::HashMap::new())?),
    }
}

async fn play_file(
    State(state): S,
    Json(request): Json<PlayFileRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = file_source(&state)?;
    let files = source
        .as_files()
        .ok_or_else(|| Error::not_supported("file control unavailable"))?;
    files.load_file(&request.path)?;
    match source.state() {
        crate::source::SourceState::Playing => {}
        _ => source.play()?,
    }
    Ok(Json(state.orchestrator.playback_state()))
}

async fn enqueue_files(
    State(state): S,
    Json(request): Json<EnqueueFilesRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.paths.is_empty() {
        return Err(Error::invalid_argument("paths must be non-empty").into());
    }
    let source = file_source(&state)?;
    let mut queued = Vec::with_capacity(request.paths.len());
    for path in &request.paths {
        queued.push(QueueItemDto::from(source.add_to_queue(path, None)?));
    }
    Ok(Json(queued))
}

// ---- radio ----

/// The radio control facet of the active primary, or BadRequest.
fn radio(state: &AppState) -> ApiResult<Arc<dyn crate::source::AudioSource>> {
    let primary = state.orchestrator.require_primary().map_err(|_| {
        ApiError(Error::invalid_argument("Radio is not the active source"))
    })?;
    if primary.as_radio().is_none() {
        return Err(Error::invalid_argument("Radio is not the active source").into());
    }
    Ok(primary)
}

macro_rules! with_radio {
    ($state:expr, $radio:ident => $body:expr) => {{
        let source = radio(&$state)?;
        let $radio = source.as_radio().expect("checked by radio()");
        $body
    }};
}

async fn radio_state(State(state): S) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => Ok(Json(r.radio_state())))
}

async fn set_frequency(
    State(state): S,
    Json(request): Json<SetFrequencyRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.set_frequency(request.frequency_hz)?;
        Ok(Json(r.radio_state()))
    })
}

async fn set_band(
    State(state): S,
    Json(request): Json<SetBandRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.set_band(&request.band)?;
        Ok(Json(r.radio_state()))
    })
}

async fn set_step(
    State(state): S,
    Json(request): Json<SetStepRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.set_step(request.step_hz)?;
        Ok(Json(r.radio_state()))
    })
}

async fn scan_start(
    State(state): S,
    Json(request): Json<ScanRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.scan_start(request.direction)?;
        Ok(Json(r.radio_state()))
    })
}

async fn scan_stop(State(state): S) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.scan_stop()?;
        Ok(Json(r.radio_state()))
    })
}

async fn set_equalizer(
    State(state): S,
    Json(request): Json<EqualizerRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.set_equalizer_mode(&request.mode)?;
        Ok(Json(r.radio_state()))
    })
}

async fn set_device_volume(
    State(state): S,
    Json(request): Json<DeviceVolumeRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.set_device_volume(request.volume)?;
        Ok(Json(r.radio_state()))
    })
}

async fn set_gain(
    State(state): S,
    Json(request): Json<GainRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.set_gain(request.gain_db)?;
        Ok(Json(r.radio_state()))
    })
}

async fn set_auto_gain(
    State(state): S,
    Json(request): Json<AutoGainRequest>,
) -> ApiResult<impl IntoResponse> {
    with_radio!(state, r => {
        r.set_auto_gain(request.enabled)?;
        Ok(Json(r.radio_state()))
    })
}

async fn list_presets(State(state): S) -> ApiResult<impl IntoResponse> {
    Ok(Json(presets::list(&state.pool).await?))
}

async fn create_preset(
    State(state): S,
    Json(request): Json<CreatePresetRequest>,
) -> ApiResult<impl IntoResponse> {
    let band = Band::parse(&request.band)?;
    let preset = presets::create(&state.pool, request.name, band, request.frequency_hz).await?;
    Ok((axum::http::StatusCode::CREATED, Json(preset)))
}

async fn delete_preset(State(state): S, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    presets::delete(&state.pool, &id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

// ---- streaming ----

fn catalog(state: &AppState) -> ApiResult<Arc<dyn StreamingCatalog>> {
    state
        .catalog
        .clone()
        .ok_or_else(|| ApiError(Error::invalid_argument("streaming source not available")))
}

async fn streaming_search(
    State(state): S,
    Query(query): Query<SearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let q = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError(Error::invalid_argument("query must be non-empty")))?;
    let types = SearchType::parse_list(&query.types)?;
    Ok(Json(catalog(&state)?.search(q, &types).await?))
}

async fn streaming_categories(State(state): S) -> ApiResult<impl IntoResponse> {
    Ok(Json(catalog(&state)?.browse_categories().await?))
}

async fn streaming_category_playlists(
    State(state): S,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(catalog(&state)?.category_playlists(&id).await?))
}

async fn streaming_user_playlists(State(state): S) -> ApiResult<impl IntoResponse> {
    Ok(Json(catalog(&state)?.user_playlists().await?))
}

async fn streaming_playlist_details(
    State(state): S,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(catalog(&state)?.playlist_details(&id).await?))
}

async fn streaming_play(
    State(state): S,
    Json(request): Json<PlayUriRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = state
        .orchestrator
        .select_source("streaming", &std::collections::HashMap::new())
        .map_err(|_| ApiError(Error::invalid_argument("streaming source not available")))?;
    let streaming = source
        .as_streaming()
        .ok_or_else(|| ApiError(Error::invalid_argument("streaming source not available")))?;
    streaming.play_uri(&request.uri, request.context_uri.as_deref())?;
    Ok(Json(state.orchestrator.playback_state()))
}

// ---- devices ----

async fn list_output_devices(State(state): S) -> impl IntoResponse {
    Json(state.devices.list_outputs())
}

async fn list_input_devices(State(state): S) -> impl IntoResponse {
    Json(state.devices.list_inputs())
}

async fn default_output_device(State(state): S) -> ApiResult<impl IntoResponse> {
    let device = state
        .devices
        .default_output()
        .ok_or_else(|| ApiError(Error::not_found("no default output device")))?;
    Ok(Json(device))
}

async fn set_output_device(
    State(state): S,
    Json(request): Json<SetOutputDeviceRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.devices.set_output(&request.device_id)?))
}

async fn refresh_devices(State(state): S) -> impl IntoResponse {
    state.devices.refresh();
    Json(serde_json::json!({
        "outputs": state.devices.list_outputs().len(),
        "inputs": state.devices.list_inputs().len(),
    }))
}

async fn list_usb_reservations(State(state): S) -> impl IntoResponse {
    let reservations: Vec<UsbReservationDto> = state
        .devices
        .reservations()
        .snapshot()
        .into_iter()
        .map(|(port_path, owner_id)| UsbReservationDto { port_path, owner_id })
        .collect();
    Json(reservations)
}

async fn check_usb_port(
    State(state): S,
    Query(query): Query<UsbCheckQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.port.trim().is_empty() {
        return Err(Error::invalid_argument("port must be non-empty").into());
    }
    Ok(Json(serde_json::json!({
        "port": query.port,
        "in_use": state.devices.reservations().is_in_use(&query.port),
        "owner": state.devices.reservations().owner(&query.port),
    })))
}

// ---- outputs ----

async fn outputs_status(State(state): S) -> impl IntoResponse {
    let shared = state.orchestrator.mixer().shared();
    let output_entry = |output: &dyn Output| {
        serde_json::json!({
            "id": output.id(),
            "name": output.name(),
            "state": output.state(),
            "volume": output.volume(),
            "muted": output.muted(),
        })
    };

    let mut outputs = Vec::new();
    if let Some(local) = &state.outputs.local {
        let mut entry = output_entry(local.as_ref());
        entry["underruns"] = serde_json::json!(local.underruns());
        outputs.push(entry);
    }
    if let Some(http) = &state.outputs.http_stream {
        let mut entry = output_entry(http.as_ref());
        entry["connected_client_count"] = serde_json::json!(http.connected_client_count());
        entry["clients"] = serde_json::to_value(http.clients()).unwrap_or_default();
        outputs.push(entry);
    }
    if let Some(cast) = &state.outputs.cast {
        let mut entry = output_entry(cast.as_ref());
        entry["device"] = serde_json::to_value(cast.connected_device()).unwrap_or_default();
        outputs.push(entry);
    }

    let bus = state.orchestrator.bus();
    Json(serde_json::json!({
        "outputs": outputs,
        "mixer": {
            "ticks": shared.ticks(),
            "underruns": shared.underruns(),
            "is_active": shared.is_active(),
            "rows": shared.graph().len(),
        },
        "events": {
            "published": bus.published(),
            "dropped": bus.dropped(),
        },
        "push_clients": bus.push_clients(),
        "stream_clients": bus.stream_clients(),
    }))
}

// ---- events ----

async fn trigger_event(
    State(state): S,
    Json(request): Json<TriggerEventRequest>,
) -> ApiResult<impl IntoResponse> {
    use crate::source::event::{BufferedClip, EventKind};
    let kind = match request.kind.to_ascii_lowercase().as_str() {
        "chime" => EventKind::Chime,
        "notification" => EventKind::Notification,
        "doorbell" => EventKind::Doorbell,
        "sound_effect" => EventKind::SoundEffect,
        "tts" | "text_to_speech" => EventKind::TextToSpeech,
        other => {
            return Err(Error::invalid_argument(format!("unknown event kind: {other}")).into());
        }
    };
    let duration = std::time::Duration::from_millis(request.duration_ms.clamp(50, 10_000));
    let clip = BufferedClip::tone(
        request.frequency_hz.clamp(100.0, 8_000.0),
        0.5,
        duration,
    );
    let id = state.orchestrator.play_event(
        kind,
        request.priority,
        request.duck_exempt,
        Box::new(clip),
        Some(duration),
    )?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(serde_json::json!({
            "id": id,
            "ducking": state.orchestrator.ducking_state(),
        })),
    ))
}

async fn cancel_event(State(state): S, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    state.orchestrator.stop_event(&id)?;
    Ok(Json(serde_json::json!({
        "stopped": id,
        "ducking": state.orchestrator.ducking_state(),
    })))
}

// ---- track identification callback ----

async fn identify_track(
    State(state): S,
    Json(request): Json<IdentifyRequest>,
) -> ApiResult<impl IntoResponse> {
    if !(0.0..=1.0).contains(&request.confidence) {
        return Err(Error::invalid_argument("confidence must be in [0,1]").into());
    }
    state
        .orchestrator
        .apply_identification(crate::orchestrator::TrackIdentified {
            title: request.title,
            artist: request.artist,
            album: request.album,
            album_art_url: request.album_art_url,
            confidence: request.confidence,
            identified_at: chrono::Utc::now(),
        });
    Ok(Json(state.orchestrator.now_playing()))
}

// ---- system ----

async fn system_stats(State(state): S) -> impl IntoResponse {
    let engine_state = if state.orchestrator.mixer().shared().is_active() {
        "Playing"
    } else {
        "Idle"
    };
    Json(state.monitor.stats(engine_state))
}

async fn system_logs(
    State(state): S,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.logs.query(&query.level, query.limit, query.max_age_minutes)?))
}

// ---- history ----

async fn record_history(
    State(state): S,
    Json(request): Json<RecordHistoryRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = history::HistoryRecord {
        source: history::HistorySource::parse(&request.source)?,
        metadata_source: request.metadata_source,
        title: request.title,
        artist: request.artist,
        album: request.album,
        duration_seconds: request.duration_seconds,
    };
    let entry = history::record(&state.pool, &record).await?;
    Ok((axum::http::StatusCode::CREATED, Json(entry)))
}

async fn history_recent(
    State(state): S,
    Query(query): Query<RecentHistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(history::list_recent(&state.pool, query.limit).await?))
}

async fn history_today(State(state): S) -> ApiResult<impl IntoResponse> {
    Ok(Json(history::list_today(&state.pool).await?))
}

async fn history_range(
    State(state): S,
    Query(query): Query<HistoryRangeQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(history::list_range(&state.pool, query.from, query.to).await?))
}

async fn history_by_source(
    State(state): S,
    Path(source): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let source = history::HistorySource::parse(&source)?;
    Ok(Json(history::list_by_source(&state.pool, source).await?))
}

async fn history_statistics(State(state): S) -> ApiResult<impl IntoResponse> {
    Ok(Json(history::statistics(&state.pool).await?))
}

async fn delete_history(State(state): S, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    history::delete(&state.pool, id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

// ---- configuration ----

async fn get_config(State(state): S) -> impl IntoResponse {
    Json(state.config.read().clone())
}

async fn get_audio_config(State(state): S) -> impl IntoResponse {
    Json(state.config.read().audio.clone())
}

async fn get_visualizer_config(State(state): S) -> impl IntoResponse {
    Json(state.config.read().visualizer.clone())
}

async fn get_output_config(State(state): S) -> impl IntoResponse {
    Json(state.config.read().output.clone())
}

async fn update_config(
    State(state): S,
    Json(request): Json<ConfigUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .config
        .write()
        .apply_update(&request.section, &request.key, &request.value);
    match result {
        // Applied in memory; persistence is deliberately unfinished
        Err(Error::NotImplemented(message)) => Ok((
            axum::http::StatusCode::NOT_IMPLEMENTED,
            Json(serde_json::json!({
                "applied": true,
                "persisted": false,
                "detail": message,
            })),
        )),
        Err(other) => Err(other.into()),
        Ok(()) => Ok((
            axum::http::StatusCode::OK,
            Json(serde_json::json!({"applied": true, "persisted": true})),
        )),
    }
}

// ---- visualization ----

async fn viz_spectrum(State(state): S) -> impl IntoResponse {
    Json((*state.viz.spectrum()).clone())
}

async fn viz_levels(State(state): S) -> impl IntoResponse {
    Json(*state.viz.levels())
}

async fn viz_waveform(State(state): S) -> impl IntoResponse {
    Json((*state.viz.waveform()).clone())
}

// ---- push hub ----

async fn ws_upgrade(State(state): S, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    let push = Arc::clone(&state.push);
    let viz = Arc::clone(&state.viz);
    let orchestrator = Arc::clone(&state.orchestrator);
    upgrade.on_upgrade(move |socket| push.serve(socket, viz, orchestrator))
}

// Outputs are controlled through configuration at startup; the OutputSet
// is carried in state for status endpoints and graceful shutdown.
impl AppState {
    /// Stop every output (used by the shutdown path).
    pub fn stop_outputs(&self) {
        if let Some(local) = &self.outputs.local {
            let _ = local.stop();
            let _ = local.dispose();
        }
        if let Some(http) = &self.outputs.http_stream {
            let _ = http.stop();
            let _ = http.dispose();
        }
        if let Some(cast) = &self.outputs.cast {
            let _ = cast.stop();
            let _ = cast.dispose();
        }
    }
}
