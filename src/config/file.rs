//! TOML configuration file loading
//!
//! Supports `~/.config/iris/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::trigger::TriggerMode;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct IrisConfigFile {
    #[serde(default)]
    pub bus: BusFileConfig,

    #[serde(default)]
    pub trigger: TriggerFileConfig,

    #[serde(default)]
    pub capture: CaptureFileConfig,

    #[serde(default)]
    pub resources: ResourcesFileConfig,

    #[serde(default)]
    pub playback: PlaybackFileConfig,

    #[serde(default)]
    pub vision: VisionFileConfig,

    #[serde(default)]
    pub speech: SpeechFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct BusFileConfig {
    /// Events kept for diagnostics
    pub history_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerFileConfig {
    pub mode: Option<TriggerMode>,
    pub english_triggers: Option<Vec<String>>,
    pub chinese_triggers: Option<Vec<String>>,
    pub cooldown_seconds: Option<f64>,
    pub fuzzy_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub timeout_seconds: Option<f64>,
    pub max_retries: Option<u32>,
    pub max_image_bytes: Option<usize>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResourcesFileConfig {
    /// Utilization fraction at which new requests are refused
    pub memory_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub chunk_size: Option<usize>,
    pub chunk_delay_ms: Option<u64>,
    pub stream_timeout_seconds: Option<f64>,
}

/// Vision provider configuration (key lives in env or here)
#[derive(Debug, Default, Deserialize)]
pub struct VisionFileConfig {
    /// "mock" or "anthropic"
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub timeout_seconds: Option<f64>,
    pub mock_answer: Option<String>,
}

/// Speech provider configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// "mock" or "openai"
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
    pub timeout_seconds: Option<f64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `IrisConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> IrisConfigFile {
    let Some(path) = config_file_path() else {
        return IrisConfigFile::default();
    };

    if !path.exists() {
        return IrisConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            IrisConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<IrisConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/iris/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("iris").join("config.toml"))
}

/// Seconds from a file or env value, refusing negatives and non-numbers
pub(crate) fn seconds(value: f64, field: &str) -> Result<std::time::Duration> {
    std::time::Duration::try_from_secs_f64(value)
        .map_err(|_| Error::Config(format!("{field} must be a non-negative number of seconds")))
}
