//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\auricle\config.toml
//! - macOS: ~/Library/Application Support/auricle/config.toml
//! - Linux: ~/.config/auricle/config.toml
//!
//! The config file is human-readable and editable. Settings are loaded at
//! startup; runtime updates through the control surface mutate the
//! in-memory copy only (the persist step is deliberately unfinished and
//! reports NotImplemented).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Audio engine settings
    pub audio: AudioConfig,

    /// Visualization pipeline settings
    pub visualizer: VisualizerConfig,

    /// Output fan-out settings
    pub output: OutputConfig,

    /// Library settings for the file source
    pub library: LibraryConfig,
}

/// Ducking ramp policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuckPolicy {
    /// Linear per-sample ramp over the full attack/release window
    #[default]
    FadeSmooth,
    /// Same shape, quarter of the configured window
    FadeQuick,
    /// Jump straight to the target level
    Instant,
}

/// Audio engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Source selected at startup ("file", "radio", "turntable", ...)
    pub default_source: String,

    /// How far background sources are attenuated while events play (0-100)
    pub duck_percentage: u8,

    /// Ramp shape for duck attack/release
    pub duck_policy: DuckPolicy,

    /// Attack ramp length in milliseconds
    pub duck_attack_ms: u32,

    /// Release ramp length in milliseconds
    pub duck_release_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            default_source: "file".to_string(),
            duck_percentage: 20,
            duck_policy: DuckPolicy::FadeSmooth,
            duck_attack_ms: 200,
            duck_release_ms: 500,
        }
    }
}

/// Visualization pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    /// FFT size (power of two)
    pub fft_size: usize,

    /// Number of time-domain samples per waveform snapshot
    pub waveform_sample_count: usize,

    /// How long a peak reading is held before decaying, in milliseconds
    pub peak_hold_time_ms: u32,

    /// Apply a Hann window before the FFT
    pub apply_window: bool,

    /// Per-bin exponential smoothing factor (0.0 = instant, 1.0 = frozen)
    pub smoothing: f32,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            waveform_sample_count: 512,
            peak_hold_time_ms: 1000,
            apply_window: true,
            smoothing: 0.7,
        }
    }
}

/// Output fan-out settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub local: LocalOutputConfig,
    pub http_stream: HttpStreamConfig,
    pub google_cast: CastConfig,
}

/// Local playback device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalOutputConfig {
    pub enabled: bool,

    /// Device id to prefer (empty = system default)
    pub preferred_device_id: String,

    /// Volume applied at startup (0.0 - 1.0)
    pub default_volume: f32,
}

impl Default for LocalOutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preferred_device_id: String::new(),
            default_volume: 1.0,
        }
    }
}

/// HTTP PCM/WAV stream server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStreamConfig {
    pub enabled: bool,
    pub port: u16,
    pub endpoint_path: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub max_concurrent_clients: usize,
    pub content_type: String,
}

impl Default for HttpStreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 5901,
            endpoint_path: "/stream/audio".to_string(),
            sample_rate: 48_000,
            channels: 2,
            max_concurrent_clients: 8,
            content_type: "audio/wav".to_string(),
        }
    }
}

/// Google Cast output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    pub enabled: bool,

    /// How long to wait for mDNS answers
    pub discovery_timeout_s: u64,

    pub default_volume: f32,

    /// URL the receiver loads; empty = derived from the HTTP stream config
    pub stream_url: String,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_timeout_s: 10,
            default_volume: 0.8,
            stream_url: String::new(),
        }
    }
}

/// Library settings for the file source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Root directory audio files are resolved against
    pub root: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("media"),
        }
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("auricle"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load configuration from disk
///
/// Returns default config if file doesn't exist or can't be parsed.
/// Logs warnings but doesn't fail - we always return a usable config.
pub fn load(override_path: Option<&std::path::Path>) -> Config {
    let path = match override_path {
        Some(p) => p.to_path_buf(),
        None => match config_path() {
            Some(p) => p,
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                return Config::default();
            }
        },
    };

    if !path.exists() {
        tracing::info!("No config file found at {:?}, using defaults", path);
        return Config::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                tracing::error!("Failed to parse config file {:?}: {}", path, e);
                tracing::warn!("Using default configuration");
                Config::default()
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file {:?}: {}", path, e);
            Config::default()
        }
    }
}

/// Save configuration to disk
///
/// Creates the config directory if it doesn't exist. Writes atomically
/// (temp file + rename) so a crash never leaves a torn config behind.
pub fn save(config: &Config) -> Result<()> {
    let dir = config_dir().ok_or_else(|| Error::external("no config directory"))?;
    let path = dir.join("config.toml");

    std::fs::create_dir_all(&dir)?;

    let contents =
        toml::to_string_pretty(config).map_err(|e| Error::external(e.to_string()))?;

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents)?;
    std::fs::rename(&temp_path, &path)?;

    tracing::info!("Saved config to {:?}", path);
    Ok(())
}

impl Config {
    /// Apply a single `section.key = value` update.
    ///
    /// The value is applied to the in-memory config so subsequent `get`s
    /// reflect it; the caller is told persistence is unfinished.
    pub fn apply_update(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        if section.trim().is_empty() || key.trim().is_empty() {
            return Err(Error::invalid_argument("section and key must be non-empty"));
        }

        match (section, key) {
            ("audio", "default_source") => self.audio.default_source = value.to_string(),
            ("audio", "duck_percentage") => {
                let v: u8 = parse(value)?;
                if v > 100 {
                    return Err(Error::invalid_argument("duck_percentage must be 0-100"));
                }
                self.audio.duck_percentage = v;
            }
            ("audio", "duck_attack_ms") => self.audio.duck_attack_ms = parse(value)?,
            ("audio", "duck_release_ms") => self.audio.duck_release_ms = parse(value)?,
            ("audio", "duck_policy") => {
                self.audio.duck_policy = match value {
                    "fade_smooth" => DuckPolicy::FadeSmooth,
                    "fade_quick" => DuckPolicy::FadeQuick,
                    "instant" => DuckPolicy::Instant,
                    other => {
                        return Err(Error::invalid_argument(format!(
                            "unknown duck policy: {other}"
                        )));
                    }
                };
            }
            ("visualizer", "fft_size") => {
                let v: usize = parse(value)?;
                if !v.is_power_of_two() || v < 256 {
                    return Err(Error::invalid_argument("fft_size must be a power of two >= 256"));
                }
                self.visualizer.fft_size = v;
            }
            ("visualizer", "waveform_sample_count") => {
                self.visualizer.waveform_sample_count = parse(value)?;
            }
            ("visualizer", "peak_hold_time_ms") => {
                self.visualizer.peak_hold_time_ms = parse(value)?;
            }
            ("visualizer", "apply_window") => self.visualizer.apply_window = parse(value)?,
            ("visualizer", "smoothing") => {
                let v: f32 = parse(value)?;
                if !(0.0..=1.0).contains(&v) {
                    return Err(Error::invalid_argument("smoothing must be in [0,1]"));
                }
                self.visualizer.smoothing = v;
            }
            ("output", "local.enabled") => self.output.local.enabled = parse(value)?,
            ("output", "http_stream.enabled") => self.output.http_stream.enabled = parse(value)?,
            ("output", "http_stream.port") => self.output.http_stream.port = parse(value)?,
            ("output", "google_cast.enabled") => self.output.google_cast.enabled = parse(value)?,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "unknown config key {section}.{key}"
                )));
            }
        }

        // Persistence of runtime updates is not wired up yet; the caller
        // surfaces this as 501 with the applied value in the body.
        Err(Error::NotImplemented(
            "config updates apply in memory only".to_string(),
        ))
    }
}

fn parse<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_argument(format!("cannot parse value: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_round_trip() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.audio.duck_percentage, 20);
        assert_eq!(parsed.visualizer.fft_size, 2048);
        assert_eq!(parsed.output.http_stream.endpoint_path, "/stream/audio");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[audio]\nduck_percentage = 35\n").unwrap();
        assert_eq!(parsed.audio.duck_percentage, 35);
        assert_eq!(parsed.audio.duck_attack_ms, 200);
        assert!(parsed.output.local.enabled);
    }

    #[test]
    fn test_apply_update_reports_not_implemented() {
        let mut config = Config::default();
        let err = config.apply_update("audio", "duck_percentage", "40").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        // But the value is visible in memory
        assert_eq!(config.audio.duck_percentage, 40);
    }

    #[test]
    fn test_apply_update_rejects_empty_section() {
        let mut config = Config::default();
        let err = config.apply_update("", "x", "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_apply_update_rejects_bad_values() {
        let mut config = Config::default();
        assert_eq!(
            config.apply_update("audio", "duck_percentage", "250").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            config.apply_update("visualizer", "fft_size", "1000").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
