//! Request/response shapes for the REST control surface, plus the
//! error-kind to status-code mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::source::queue::QueueItem;

/// Wrapper that maps [`Error`] kinds onto canonical HTTP status codes.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument | ErrorKind::IllegalState => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotSupported | ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::External => StatusCode::BAD_GATEWAY,
        // Client closed request (nginx convention)
        ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        ErrorKind::AlreadyDisposed => StatusCode::GONE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!("request rejected: {}", self.0);
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": format!("{kind:?}"),
        });
        (status, Json(body)).into_response()
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ---- volume ----

#[derive(Debug, Serialize)]
pub struct VolumeDto {
    pub volume: f32,
    pub is_muted: bool,
    pub balance: f32,
}

#[derive(Debug, Deserialize)]
pub struct SetVolumeRequest {
    pub volume: f32,
}

#[derive(Debug, Deserialize)]
pub struct SetBalanceRequest {
    pub balance: f32,
}

// ---- sources ----

#[derive(Debug, Deserialize)]
pub struct SelectSourceRequest {
    pub source_type: String,
    #[serde(default)]
    pub config: std::collections::HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct AudioSourceDto {
    pub id: String,
    pub name: String,
    pub source_type: String,
    pub category: String,
    pub state: crate::source::SourceState,
    pub volume: f32,
    pub seekable: bool,
    pub has_queue: bool,
    pub supports_next: bool,
    pub supports_previous: bool,
    pub supports_shuffle: bool,
    pub supports_repeat: bool,
    pub position_ms: Option<u64>,
    pub duration_ms: Option<u64>,
}

impl AudioSourceDto {
    pub fn from_source(source: &dyn crate::source::AudioSource) -> Self {
        use crate::source::Capabilities;
        let caps = source.capabilities();
        Self {
            id: source.id().to_string(),
            name: source.name().to_string(),
            source_type: source.kind().as_str().to_string(),
            category: match source.category() {
                crate::source::SourceCategory::Primary => "Primary".to_string(),
                crate::source::SourceCategory::Event => "Event".to_string(),
            },
            state: source.state(),
            volume: source.volume(),
            seekable: caps.contains(Capabilities::SEEKABLE),
            has_queue: caps.contains(Capabilities::QUEUE),
            supports_next: caps.contains(Capabilities::NEXT),
            supports_previous: caps.contains(Capabilities::PREVIOUS),
            supports_shuffle: caps.contains(Capabilities::SHUFFLE),
            supports_repeat: caps.contains(Capabilities::REPEAT),
            position_ms: source.position().map(|d| d.as_millis() as u64),
            duration_ms: source.duration().map(|d| d.as_millis() as u64),
        }
    }
}

// ---- queue ----

#[derive(Debug, Serialize)]
pub struct QueueItemDto {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_ms: Option<u64>,
    pub album_art_url: Option<String>,
    pub index: usize,
    pub is_current: bool,
}

impl From<QueueItem> for QueueItemDto {
    fn from(item: QueueItem) -> Self {
        Self {
            id: item.id,
            title: item.title,
            artist: item.artist,
            album: item.album,
            duration_ms: item.duration.map(|d| d.as_millis() as u64),
            album_art_url: item.album_art_url,
            index: item.index,
            is_current: item.is_current,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddToQueueRequest {
    pub identifier: String,
    pub position: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct MoveQueueItemRequest {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Deserialize)]
pub struct JumpRequest {
    pub index: usize,
}

#[derive(Debug, Deserialize)]
pub struct ShuffleRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RepeatRequest {
    pub mode: String,
}

// ---- files ----

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
pub struct FileInfoDto {
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct PlayFileRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueFilesRequest {
    pub paths: Vec<String>,
}

// ---- radio ----

#[derive(Debug, Deserialize)]
pub struct SetFrequencyRequest {
    pub frequency_hz: u64,
}

#[derive(Debug, Deserialize)]
pub struct SetBandRequest {
    pub band: String,
}

#[derive(Debug, Deserialize)]
pub struct SetStepRequest {
    pub step_hz: u64,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub direction: crate::source::radio::ScanDirection,
}

#[derive(Debug, Deserialize)]
pub struct EqualizerRequest {
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceVolumeRequest {
    pub volume: u8,
}

#[derive(Debug, Deserialize)]
pub struct GainRequest {
    pub gain_db: f32,
}

#[derive(Debug, Deserialize)]
pub struct AutoGainRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreatePresetRequest {
    pub name: Option<String>,
    pub band: String,
    pub frequency_hz: u64,
}

// ---- streaming ----

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    #[serde(default)]
    pub types: String,
}

#[derive(Debug, Deserialize)]
pub struct PlayUriRequest {
    pub uri: String,
    pub context_uri: Option<String>,
}

// ---- devices ----

#[derive(Debug, Deserialize)]
pub struct SetOutputDeviceRequest {
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UsbCheckQuery {
    pub port: String,
}

#[derive(Debug, Serialize)]
pub struct UsbReservationDto {
    pub port_path: String,
    pub owner_id: String,
}

// ---- system ----

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
    pub max_age_minutes: Option<i64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_limit() -> usize {
    200
}

// ---- history ----

#[derive(Debug, Deserialize)]
pub struct RecentHistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct HistoryRangeQuery {
    pub from: chrono::DateTime<chrono::Utc>,
    pub to: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RecordHistoryRequest {
    pub source: String,
    pub metadata_source: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<f64>,
}

// ---- events ----

#[derive(Debug, Deserialize)]
pub struct TriggerEventRequest {
    pub kind: String,
    #[serde(default = "default_event_priority")]
    pub priority: u8,
    #[serde(default)]
    pub duck_exempt: bool,
    #[serde(default = "default_event_frequency")]
    pub frequency_hz: f32,
    #[serde(default = "default_event_duration")]
    pub duration_ms: u64,
}

fn default_event_priority() -> u8 {
    5
}

fn default_event_frequency() -> f32 {
    880.0
}

fn default_event_duration() -> u64 {
    750
}

// ---- track identification ----

#[derive(Debug, Deserialize)]
pub struct IdentifyRequest {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub album_art_url: Option<String>,
    pub confidence: f64,
}

// ---- configuration ----

#[derive(Debug, Deserialize)]
pub struct ConfigUpdateRequest {
    pub section: String,
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::IllegalState), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::NotSupported), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::External), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Cancelled).as_u16(), 499);
        assert_eq!(status_for(ErrorKind::AlreadyDisposed), StatusCode::GONE);
    }

    #[test]
    fn test_queue_item_dto_conversion() {
        let item = QueueItem {
            id: "a.mp3".to_string(),
            title: "A".to_string(),
            artist: None,
            album: None,
            duration: Some(std::time::Duration::from_secs(90)),
            album_art_url: None,
            index: 2,
            is_current: true,
        };
        let dto = QueueItemDto::from(item);
        assert_eq!(dto.duration_ms, Some(90_000));
        assert_eq!(dto.index, 2);
        assert!(dto.is_current);
    }
}
