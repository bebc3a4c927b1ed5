//! User-facing error taxonomy
//!
//! Maps every [`ErrorKind`] to the message the user hears, an optional
//! pre-recorded clip the device can play instead, and a retry budget.

use std::fmt;

use serde::{Serialize, Serializer};

use super::retry::RetryPolicy;

/// Closed set of user-visible failure kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Connection (ASR/transport)
    ConnectionFailed,
    ConnectionTimeout,
    WebsocketClosed,
    AsrConnectionFailed,
    AsrTimeout,
    // Capture
    CaptureTimeout,
    CaptureFailed,
    InvalidImage,
    // Vision
    VisionTimeout,
    VisionApiError,
    // Synthesis
    SynthesisFailed,
    // Resource/admission
    ConcurrentLimit,
    MemoryLow,
    // Generic fallback
    Internal,
    /// A tag this build does not know; handled with the generic entry
    Unknown(String),
}

impl ErrorKind {
    /// Every mapped kind (excludes [`ErrorKind::Unknown`])
    pub const MAPPED: [Self; 14] = [
        Self::ConnectionFailed,
        Self::ConnectionTimeout,
        Self::WebsocketClosed,
        Self::AsrConnectionFailed,
        Self::AsrTimeout,
        Self::CaptureTimeout,
        Self::CaptureFailed,
        Self::InvalidImage,
        Self::VisionTimeout,
        Self::VisionApiError,
        Self::SynthesisFailed,
        Self::ConcurrentLimit,
        Self::MemoryLow,
        Self::Internal,
    ];

    /// Wire tag (e.g. `"capture_timeout"`)
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::ConnectionTimeout => "connection_timeout",
            Self::WebsocketClosed => "websocket_closed",
            Self::AsrConnectionFailed => "asr_connection_failed",
            Self::AsrTimeout => "asr_timeout",
            Self::CaptureTimeout => "capture_timeout",
            Self::CaptureFailed => "capture_failed",
            Self::InvalidImage => "invalid_image",
            Self::VisionTimeout => "vision_timeout",
            Self::VisionApiError => "vision_api_error",
            Self::SynthesisFailed => "tts_failed",
            Self::ConcurrentLimit => "concurrent_request_limit",
            Self::MemoryLow => "memory_low",
            Self::Internal => "internal_error",
            Self::Unknown(tag) => tag,
        }
    }

    /// Parse a wire tag; unrecognized tags become [`ErrorKind::Unknown`]
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        Self::MAPPED
            .into_iter()
            .find(|kind| kind.as_str() == tag)
            .unwrap_or_else(|| Self::Unknown(tag.to_string()))
    }

    /// Whether this kind is itself a synthesis failure
    ///
    /// Such errors are never voiced, or voicing them would fail again.
    #[must_use]
    pub const fn is_synthesis_failure(&self) -> bool {
        matches!(self, Self::SynthesisFailed)
    }

    /// Static table entry for this kind
    #[must_use]
    pub const fn entry(&self) -> ErrorEntry {
        match self {
            Self::AsrConnectionFailed | Self::AsrTimeout => ErrorEntry {
                message: "I couldn't understand that, please try again",
                prerecorded_file: Some("error_asr.pcm"),
                retry: RetryPolicy::never(),
            },
            Self::CaptureTimeout | Self::CaptureFailed | Self::InvalidImage => ErrorEntry {
                message: "Camera unavailable, please try again",
                prerecorded_file: Some("error_camera.pcm"),
                retry: RetryPolicy::up_to(2),
            },
            Self::VisionTimeout | Self::VisionApiError => ErrorEntry {
                message: "I couldn't analyze the image, please try again",
                prerecorded_file: Some("error_vision.pcm"),
                retry: RetryPolicy::never(),
            },
            Self::SynthesisFailed => ErrorEntry {
                message: "Audio system error",
                prerecorded_file: Some("error_tts.pcm"),
                retry: RetryPolicy::up_to(1),
            },
            Self::ConnectionFailed | Self::ConnectionTimeout | Self::WebsocketClosed => {
                ErrorEntry {
                    message: "Connection lost, reconnecting",
                    prerecorded_file: Some("error_network.pcm"),
                    retry: RetryPolicy::up_to(3),
                }
            }
            Self::ConcurrentLimit => ErrorEntry {
                message: "I'm still working on your last question, please wait",
                prerecorded_file: Some("error_busy.pcm"),
                retry: RetryPolicy::never(),
            },
            Self::MemoryLow => ErrorEntry {
                message: "Memory low, please wait",
                prerecorded_file: Some("error_memory.pcm"),
                retry: RetryPolicy::never(),
            },
            Self::Internal | Self::Unknown(_) => GENERIC_ENTRY,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Static description of how a failure is presented and retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    /// User-facing message text
    pub message: &'static str,
    /// Pre-recorded fallback clip identifier
    pub prerecorded_file: Option<&'static str>,
    pub retry: RetryPolicy,
}

/// Entry used for internal and unmapped failures
pub const GENERIC_ENTRY: ErrorEntry = ErrorEntry {
    message: "System error, please try again",
    prerecorded_file: None,
    retry: RetryPolicy::never(),
};
