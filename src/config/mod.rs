//! Configuration management for the Iris gateway

pub mod file;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;

use self::file::{IrisConfigFile, seconds};
use crate::events::DEFAULT_HISTORY_SIZE;
use crate::playback::DEFAULT_CHUNK_SIZE;
use crate::resources::DEFAULT_MEMORY_THRESHOLD;
use crate::trigger::TriggerMode;
use crate::{Error, Result};

/// English trigger phrases, checked in this order
pub const DEFAULT_ENGLISH_TRIGGERS: &[&str] = &[
    "what do i see",
    "what is this",
    "what am i looking at",
    "describe this",
    "tell me what you see",
];

/// Chinese trigger phrases (Mandarin, Traditional, Cantonese)
pub const DEFAULT_CHINESE_TRIGGERS: &[&str] = &[
    "这是什么",
    "這是什麼",
    "识别物品",
    "辨識物品",
    "睇下呢個",
];

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_VISION_MODEL: &str = "claude-sonnet-4-20250514";
const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Iris gateway configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub bus: BusConfig,
    pub trigger: TriggerConfig,
    pub capture: CaptureConfig,
    pub resources: ResourceConfig,
    pub playback: PlaybackConfig,
    pub vision: VisionConfig,
    pub speech: SpeechConfig,
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events retained for `get_history`
    pub history_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

/// Trigger detection configuration
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub mode: TriggerMode,
    pub english_triggers: Vec<String>,
    pub chinese_triggers: Vec<String>,
    /// Minimum time between two triggers
    pub cooldown: Duration,
    /// Normalized similarity (0.0 to 1.0) a fuzzy match must reach
    pub fuzzy_threshold: f64,
}

impl TriggerConfig {
    /// All phrases in match order: English first, then Chinese
    pub fn phrases(&self) -> impl Iterator<Item = &str> {
        self.english_triggers
            .iter()
            .chain(&self.chinese_triggers)
            .map(String::as_str)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            mode: TriggerMode::default(),
            english_triggers: DEFAULT_ENGLISH_TRIGGERS.iter().map(ToString::to_string).collect(),
            chinese_triggers: DEFAULT_CHINESE_TRIGGERS.iter().map(ToString::to_string).collect(),
            cooldown: Duration::from_secs(3),
            fuzzy_threshold: 0.85,
        }
    }
}

/// Capture request configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// How long one attempt waits for the image
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub max_image_bytes: usize,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            max_image_bytes: 200 * 1024,
            max_width: 640,
            max_height: 480,
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Memory utilization at which new requests are refused
    pub memory_threshold: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
        }
    }
}

/// Audio streaming configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub chunk_size: usize,
    /// Pause between chunks so the device buffer keeps up
    pub chunk_delay: Duration,
    /// Deadline for sending one chunk
    pub stream_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(10),
            stream_timeout: Duration::from_secs(10),
        }
    }
}

/// Vision backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisionProvider {
    #[default]
    Mock,
    Anthropic,
}

impl FromStr for VisionProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(Error::Config(format!("unknown vision provider: {other}"))),
        }
    }
}

/// Vision analysis configuration
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub provider: VisionProvider,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub endpoint: String,
    /// Upper bound on one analysis call
    pub timeout: Duration,
    /// Answer returned by the mock provider
    pub mock_answer: String,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            provider: VisionProvider::default(),
            api_key: None,
            model: DEFAULT_VISION_MODEL.to_string(),
            endpoint: ANTHROPIC_API_URL.to_string(),
            timeout: Duration::from_secs(15),
            mock_answer: "I can see a red apple on a wooden table".to_string(),
        }
    }
}

/// Speech backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeechProvider {
    #[default]
    Mock,
    OpenAi,
}

impl FromStr for SpeechProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!("unknown speech provider: {other}"))),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub provider: SpeechProvider,
    pub api_key: Option<SecretString>,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    /// Audio container requested from the provider
    pub format: String,
    pub sample_rate: u32,
    /// Upper bound on one synthesis call
    pub timeout: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            provider: SpeechProvider::default(),
            api_key: None,
            endpoint: OPENAI_SPEECH_URL.to_string(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            format: "pcm".to_string(),
            sample_rate: 16_000,
            timeout: Duration::from_secs(10),
        }
    }
}

fn parse<T: FromStr>(value: Option<String>, name: &str) -> Result<Option<T>> {
    value
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}")))
        })
        .transpose()
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value.filter(|v| !v.trim().is_empty()).map(SecretString::from)
}

impl Config {
    /// Load configuration from the standard config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment value is malformed or the result
    /// fails validation
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |name| std::env::var(name).ok())
    }

    /// Load configuration using an explicit config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, an environment
    /// value is malformed, or the result fails validation
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::from_sources(file::read_config_file(path)?, |name| std::env::var(name).ok())
    }

    /// Merge sources with precedence env > file > default, then validate
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or the result fails validation
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: IrisConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let bus = BusConfig {
            history_size: parse(env("IRIS_EVENT_BUFFER_SIZE"), "IRIS_EVENT_BUFFER_SIZE")?
                .or(fc.bus.history_size)
                .unwrap_or(defaults.bus.history_size),
        };

        let cooldown = parse::<f64>(env("IRIS_COOLDOWN_SECONDS"), "IRIS_COOLDOWN_SECONDS")?
            .or(fc.trigger.cooldown_seconds)
            .map(|s| seconds(s, "cooldown"))
            .transpose()?;
        let trigger = TriggerConfig {
            mode: match env("IRIS_TRIGGER_MODE") {
                Some(mode) => match mode.trim().to_lowercase().as_str() {
                    "keyword" => TriggerMode::Keyword,
                    "question" => TriggerMode::Question,
                    _ => return Err(Error::Config(format!("invalid trigger mode: {mode}"))),
                },
                None => fc.trigger.mode.unwrap_or(defaults.trigger.mode),
            },
            english_triggers: fc
                .trigger
                .english_triggers
                .unwrap_or(defaults.trigger.english_triggers),
            chinese_triggers: fc
                .trigger
                .chinese_triggers
                .unwrap_or(defaults.trigger.chinese_triggers),
            cooldown: cooldown.unwrap_or(defaults.trigger.cooldown),
            fuzzy_threshold: parse(env("IRIS_FUZZY_THRESHOLD"), "IRIS_FUZZY_THRESHOLD")?
                .or(fc.trigger.fuzzy_threshold)
                .unwrap_or(defaults.trigger.fuzzy_threshold),
        };

        let capture_timeout =
            parse::<f64>(env("IRIS_CAPTURE_TIMEOUT_SECONDS"), "IRIS_CAPTURE_TIMEOUT_SECONDS")?
                .or(fc.capture.timeout_seconds)
                .map(|s| seconds(s, "capture timeout"))
                .transpose()?;
        let capture = CaptureConfig {
            timeout: capture_timeout.unwrap_or(defaults.capture.timeout),
            max_retries: parse(env("IRIS_CAPTURE_MAX_RETRIES"), "IRIS_CAPTURE_MAX_RETRIES")?
                .or(fc.capture.max_retries)
                .unwrap_or(defaults.capture.max_retries),
            max_image_bytes: fc
                .capture
                .max_image_bytes
                .unwrap_or(defaults.capture.max_image_bytes),
            max_width: fc.capture.max_width.unwrap_or(defaults.capture.max_width),
            max_height: fc.capture.max_height.unwrap_or(defaults.capture.max_height),
        };

        let resources = ResourceConfig {
            memory_threshold: parse(env("IRIS_MEMORY_THRESHOLD"), "IRIS_MEMORY_THRESHOLD")?
                .or(fc.resources.memory_threshold)
                .unwrap_or(defaults.resources.memory_threshold),
        };

        let stream_timeout = fc
            .playback
            .stream_timeout_seconds
            .map(|s| seconds(s, "stream timeout"))
            .transpose()?;
        let playback = PlaybackConfig {
            chunk_size: parse(env("IRIS_CHUNK_SIZE"), "IRIS_CHUNK_SIZE")?
                .or(fc.playback.chunk_size)
                .unwrap_or(defaults.playback.chunk_size),
            chunk_delay: fc
                .playback
                .chunk_delay_ms
                .map_or(defaults.playback.chunk_delay, Duration::from_millis),
            stream_timeout: stream_timeout.unwrap_or(defaults.playback.stream_timeout),
        };

        let vision_timeout =
            parse::<f64>(env("IRIS_VISION_TIMEOUT_SECONDS"), "IRIS_VISION_TIMEOUT_SECONDS")?
                .or(fc.vision.timeout_seconds)
                .map(|s| seconds(s, "vision timeout"))
                .transpose()?;
        let vision_provider = match env("IRIS_VISION_PROVIDER").or(fc.vision.provider) {
            Some(provider) => provider.parse()?,
            None => defaults.vision.provider,
        };
        let vision = VisionConfig {
            provider: vision_provider,
            api_key: secret(env("VISION_API_KEY").or(fc.vision.api_key)),
            model: env("VISION_MODEL")
                .or(fc.vision.model)
                .unwrap_or(defaults.vision.model),
            endpoint: env("VISION_ENDPOINT")
                .or(fc.vision.endpoint)
                .unwrap_or(defaults.vision.endpoint),
            timeout: vision_timeout.unwrap_or(defaults.vision.timeout),
            mock_answer: fc.vision.mock_answer.unwrap_or(defaults.vision.mock_answer),
        };

        let speech_timeout = fc
            .speech
            .timeout_seconds
            .map(|s| seconds(s, "speech timeout"))
            .transpose()?;
        let speech_provider = match env("IRIS_SPEECH_PROVIDER").or(fc.speech.provider) {
            Some(provider) => provider.parse()?,
            None => defaults.speech.provider,
        };
        let speech = SpeechConfig {
            provider: speech_provider,
            api_key: secret(env("TTS_API_KEY").or(fc.speech.api_key)),
            endpoint: env("TTS_ENDPOINT")
                .or(fc.speech.endpoint)
                .unwrap_or(defaults.speech.endpoint),
            model: env("TTS_MODEL")
                .or(fc.speech.model)
                .unwrap_or(defaults.speech.model),
            voice: env("TTS_VOICE")
                .or(fc.speech.voice)
                .unwrap_or(defaults.speech.voice),
            format: fc.speech.format.unwrap_or(defaults.speech.format),
            sample_rate: fc.speech.sample_rate.unwrap_or(defaults.speech.sample_rate),
            timeout: speech_timeout.unwrap_or(defaults.speech.timeout),
        };

        let config = Self {
            bus,
            trigger,
            capture,
            resources,
            playback,
            vision,
            speech,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first out-of-range value
    pub fn validate(&self) -> Result<()> {
        let unit = |value: f64, name: &str| {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(Error::Config(format!("{name} must be in (0, 1], got {value}")))
            }
        };
        unit(self.trigger.fuzzy_threshold, "trigger.fuzzy_threshold")?;
        unit(self.resources.memory_threshold, "resources.memory_threshold")?;

        if self.playback.chunk_size == 0 {
            return Err(Error::Config("playback.chunk_size must be positive".to_string()));
        }
        if self.bus.history_size == 0 {
            return Err(Error::Config("bus.history_size must be positive".to_string()));
        }
        if self.capture.timeout.is_zero() {
            return Err(Error::Config("capture.timeout must be positive".to_string()));
        }
        if self.trigger.phrases().all(|p| p.trim().is_empty()) {
            return Err(Error::Config("at least one trigger phrase is required".to_string()));
        }
        Ok(())
    }

    /// Configuration as JSON with secrets reduced to whether they are set
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        json!({
            "bus": { "history_size": self.bus.history_size },
            "trigger": {
                "mode": self.trigger.mode,
                "english_triggers": self.trigger.english_triggers,
                "chinese_triggers": self.trigger.chinese_triggers,
                "cooldown_seconds": self.trigger.cooldown.as_secs_f64(),
                "fuzzy_threshold": self.trigger.fuzzy_threshold,
            },
            "capture": {
                "timeout_seconds": self.capture.timeout.as_secs_f64(),
                "max_retries": self.capture.max_retries,
                "max_image_bytes": self.capture.max_image_bytes,
                "max_width": self.capture.max_width,
                "max_height": self.capture.max_height,
            },
            "resources": { "memory_threshold": self.resources.memory_threshold },
            "playback": {
                "chunk_size": self.playback.chunk_size,
                "chunk_delay_ms": u64::try_from(self.playback.chunk_delay.as_millis()).unwrap_or(u64::MAX),
                "stream_timeout_seconds": self.playback.stream_timeout.as_secs_f64(),
            },
            "vision": {
                "provider": format!("{:?}", self.vision.provider).to_lowercase(),
                "api_key_set": self.vision.api_key.is_some(),
                "model": self.vision.model,
                "endpoint": self.vision.endpoint,
                "timeout_seconds": self.vision.timeout.as_secs_f64(),
            },
            "speech": {
                "provider": format!("{:?}", self.speech.provider).to_lowercase(),
                "api_key_set": self.speech.api_key.is_some(),
                "endpoint": self.speech.endpoint,
                "model": self.speech.model,
                "voice": self.speech.voice,
                "format": self.speech.format,
                "sample_rate": self.speech.sample_rate,
                "timeout_seconds": self.speech.timeout.as_secs_f64(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_sources(IrisConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.bus.history_size, 100);
        assert_eq!(config.trigger.cooldown, Duration::from_secs(3));
        assert_eq!(config.capture.max_retries, 2);
        assert_eq!(config.playback.chunk_size, 4096);
        assert_eq!(config.vision.provider, VisionProvider::Mock);
        assert_eq!(config.speech.format, "pcm");
        assert_eq!(config.trigger.phrases().next(), Some("what do i see"));
        assert_eq!(config.trigger.phrases().count(), 10);
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = IrisConfigFile::default();
        fc.capture.max_retries = Some(5);
        fc.trigger.cooldown_seconds = Some(7.0);
        fc.vision.api_key = Some("file-key".to_string());

        let config = Config::from_sources(
            fc,
            env_of(&[
                ("IRIS_CAPTURE_MAX_RETRIES", "1"),
                ("VISION_API_KEY", "env-key"),
                ("IRIS_TRIGGER_MODE", "Keyword"),
                ("IRIS_VISION_PROVIDER", "anthropic"),
            ]),
        )
        .unwrap();

        assert_eq!(config.capture.max_retries, 1);
        assert_eq!(config.trigger.cooldown, Duration::from_secs(7));
        assert_eq!(config.trigger.mode, TriggerMode::Keyword);
        assert_eq!(config.vision.provider, VisionProvider::Anthropic);
        assert_eq!(
            config.vision.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("env-key".to_string())
        );
    }

    #[test]
    fn malformed_env_is_an_error() {
        let result = Config::from_sources(
            IrisConfigFile::default(),
            env_of(&[("IRIS_CAPTURE_MAX_RETRIES", "many")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let result =
            Config::from_sources(IrisConfigFile::default(), env_of(&[("IRIS_SPEECH_PROVIDER", "bark")]));
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let mut fc = IrisConfigFile::default();
        fc.resources.memory_threshold = Some(1.5);
        assert!(Config::from_sources(fc, env_of(&[])).is_err());

        let mut fc = IrisConfigFile::default();
        fc.playback.chunk_size = Some(0);
        assert!(Config::from_sources(fc, env_of(&[])).is_err());
    }

    #[test]
    fn blank_api_key_counts_as_unset() {
        let config =
            Config::from_sources(IrisConfigFile::default(), env_of(&[("TTS_API_KEY", "  ")])).unwrap();
        assert!(config.speech.api_key.is_none());
    }

    #[test]
    fn redacted_view_hides_keys() {
        let config = Config {
            vision: VisionConfig {
                api_key: Some(SecretString::from("sk-secret".to_string())),
                ..VisionConfig::default()
            },
            ..Config::default()
        };
        let view = config.redacted();
        assert_eq!(view["vision"]["api_key_set"], true);
        assert!(!view.to_string().contains("sk-secret"));
        assert_eq!(view["trigger"]["mode"], "question");
    }
}
