//! Event model and in-process event bus
//!
//! Every component talks to every other component only by publishing
//! [`Event`]s on the [`EventBus`]. Events are immutable once published;
//! subscribers receive them behind an `Arc`.

mod bus;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::recovery::ErrorKind;

pub use bus::{BusStats, DEFAULT_HISTORY_SIZE, EventBus, Subscription, Topic};

/// Closed set of event kinds flowing through the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    AsrFinal,
    TriggerFired,
    QuestionDetected,
    CaptureRequested,
    CaptureReceived,
    VisionStarted,
    VisionResult,
    SynthesisRequired,
    AudioReady,
    PlaybackStarted,
    PlaybackComplete,
    PlaybackError,
    Error,
    LockAcquired,
    LockReleased,
    RequestRejected,
    MemoryLow,
}

impl EventKind {
    /// All kinds, in pipeline order
    pub const ALL: [Self; 17] = [
        Self::AsrFinal,
        Self::TriggerFired,
        Self::QuestionDetected,
        Self::CaptureRequested,
        Self::CaptureReceived,
        Self::VisionStarted,
        Self::VisionResult,
        Self::SynthesisRequired,
        Self::AudioReady,
        Self::PlaybackStarted,
        Self::PlaybackComplete,
        Self::PlaybackError,
        Self::Error,
        Self::LockAcquired,
        Self::LockReleased,
        Self::RequestRejected,
        Self::MemoryLow,
    ];

    /// Wire name of the kind (e.g. `"asr.final"`)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AsrFinal => "asr.final",
            Self::TriggerFired => "trigger.fired",
            Self::QuestionDetected => "question.detected",
            Self::CaptureRequested => "capture.requested",
            Self::CaptureReceived => "capture.received",
            Self::VisionStarted => "vision.started",
            Self::VisionResult => "vision.result",
            Self::SynthesisRequired => "synthesis.required",
            Self::AudioReady => "audio.ready",
            Self::PlaybackStarted => "playback.started",
            Self::PlaybackComplete => "playback.complete",
            Self::PlaybackError => "playback.error",
            Self::Error => "error",
            Self::LockAcquired => "request.lock_acquired",
            Self::LockReleased => "request.lock_released",
            Self::RequestRejected => "request.rejected",
            Self::MemoryLow => "memory.low",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Binary payloads are reported by length in serialized diagnostics
fn byte_len<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(bytes.len() as u64)
}

/// Payload of an `error` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub error_type: ErrorKind,
    /// User-safe message text
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prerecorded_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Kind-specific event data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    #[serde(rename = "asr.final")]
    AsrFinal { text: String, device_id: String },

    #[serde(rename = "trigger.fired")]
    TriggerFired {
        trigger_text: String,
        matched_keyword: String,
        device_id: String,
    },

    #[serde(rename = "question.detected")]
    QuestionDetected {
        question: String,
        device_id: String,
        confidence: f64,
    },

    #[serde(rename = "capture.requested")]
    CaptureRequested {
        device_id: String,
        trigger_text: String,
        retry_count: u32,
    },

    #[serde(rename = "capture.received")]
    CaptureReceived {
        device_id: String,
        #[serde(rename = "image_bytes", serialize_with = "byte_len")]
        image: Bytes,
    },

    #[serde(rename = "vision.started")]
    VisionStarted { prompt: String, device_id: String },

    #[serde(rename = "vision.result")]
    VisionResult {
        text: String,
        confidence: Option<f64>,
        device_id: String,
        is_error: bool,
    },

    /// Text that must be voiced to the user (error messages)
    #[serde(rename = "synthesis.required")]
    SynthesisRequired {
        text: String,
        device_id: Option<String>,
        prerecorded_file: Option<String>,
        is_error_message: bool,
    },

    #[serde(rename = "audio.ready")]
    AudioReady {
        #[serde(rename = "audio_bytes", serialize_with = "byte_len")]
        audio: Bytes,
        format: String,
        sample_rate: u32,
        device_id: String,
    },

    #[serde(rename = "playback.started")]
    PlaybackStarted { device_id: String },

    #[serde(rename = "playback.complete")]
    PlaybackComplete { device_id: String },

    #[serde(rename = "playback.error")]
    PlaybackError { device_id: String, error: String },

    #[serde(rename = "error")]
    Error(ErrorPayload),

    #[serde(rename = "request.lock_acquired")]
    LockAcquired { device_id: String },

    #[serde(rename = "request.lock_released")]
    LockReleased { device_id: String, held_ms: u64 },

    #[serde(rename = "request.rejected")]
    RequestRejected {
        device_id: String,
        reason: String,
        active_request_id: Option<String>,
    },

    #[serde(rename = "memory.low")]
    MemoryLow {
        device_id: String,
        memory_usage: f64,
        threshold: f64,
    },
}

impl EventPayload {
    /// The kind this payload belongs to
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::AsrFinal { .. } => EventKind::AsrFinal,
            Self::TriggerFired { .. } => EventKind::TriggerFired,
            Self::QuestionDetected { .. } => EventKind::QuestionDetected,
            Self::CaptureRequested { .. } => EventKind::CaptureRequested,
            Self::CaptureReceived { .. } => EventKind::CaptureReceived,
            Self::VisionStarted { .. } => EventKind::VisionStarted,
            Self::VisionResult { .. } => EventKind::VisionResult,
            Self::SynthesisRequired { .. } => EventKind::SynthesisRequired,
            Self::AudioReady { .. } => EventKind::AudioReady,
            Self::PlaybackStarted { .. } => EventKind::PlaybackStarted,
            Self::PlaybackComplete { .. } => EventKind::PlaybackComplete,
            Self::PlaybackError { .. } => EventKind::PlaybackError,
            Self::Error(_) => EventKind::Error,
            Self::LockAcquired { .. } => EventKind::LockAcquired,
            Self::LockReleased { .. } => EventKind::LockReleased,
            Self::RequestRejected { .. } => EventKind::RequestRejected,
            Self::MemoryLow { .. } => EventKind::MemoryLow,
        }
    }

    /// Device the payload refers to, when it names one
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::AsrFinal { device_id, .. }
            | Self::TriggerFired { device_id, .. }
            | Self::QuestionDetected { device_id, .. }
            | Self::CaptureRequested { device_id, .. }
            | Self::CaptureReceived { device_id, .. }
            | Self::VisionStarted { device_id, .. }
            | Self::VisionResult { device_id, .. }
            | Self::AudioReady { device_id, .. }
            | Self::PlaybackStarted { device_id }
            | Self::PlaybackComplete { device_id }
            | Self::PlaybackError { device_id, .. }
            | Self::LockAcquired { device_id }
            | Self::LockReleased { device_id, .. }
            | Self::RequestRejected { device_id, .. }
            | Self::MemoryLow { device_id, .. } => Some(device_id),
            Self::SynthesisRequired { device_id, .. } => device_id.as_deref(),
            Self::Error(payload) => payload.device_id.as_deref(),
        }
    }
}

/// An immutable bus event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Create an event stamped with the current time
    #[must_use]
    pub fn new(request_id: Option<String>, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            payload,
        }
    }

    /// Create an event scoped to a request
    #[must_use]
    pub fn for_request(request_id: &str, payload: EventPayload) -> Self {
        Self::new(Some(request_id.to_string()), payload)
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.payload.device_id()
    }
}
