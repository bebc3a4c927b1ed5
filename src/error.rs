//! Error types for the Iris gateway

use thiserror::Error;

/// Result type alias for Iris operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Iris gateway
///
/// These are internal failures. What the user hears about a failure is
/// decided by [`crate::recovery::ErrorKind`], never by these messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device transport error (disconnected device, closed link)
    #[error("transport error: {0}")]
    Transport(String),

    /// Image capture error
    #[error("capture error: {0}")]
    Capture(String),

    /// Vision API error
    #[error("vision error: {0}")]
    Vision(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Audio playback streaming error
    #[error("playback error: {0}")]
    Playback(String),

    /// Collaborator call exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
