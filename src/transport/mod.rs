//! Device transport abstraction
//!
//! The core never touches sockets. Outbound traffic goes through
//! [`DeviceTransport::send`]; inbound traffic arrives as [`DeviceEvent`]s
//! handed to the orchestrator by whatever terminates the device connection.

mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use memory::InMemoryTransport;

/// Message sent to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Ask the device to take a snapshot
    CaptureRequest { request_id: String, retry_count: u32 },
    /// One slice of a synthesized answer
    AudioChunk {
        request_id: String,
        #[serde(with = "base64_bytes")]
        data: Bytes,
        sequence: usize,
        total_chunks: usize,
        format: String,
        sample_rate: u32,
    },
}

impl DeviceMessage {
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::CaptureRequest { request_id, .. } | Self::AudioChunk { request_id, .. } => {
                request_id
            }
        }
    }
}

/// Message received from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Finalized speech recognition result for the device's microphone
    Transcript {
        device_id: String,
        text: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Snapshot answering a capture request
    ImageCaptured {
        device_id: String,
        request_id: String,
        #[serde(with = "base64_bytes")]
        image: Bytes,
    },
    /// The device drained its audio buffer
    PlaybackFinished { device_id: String, request_id: String },
    /// Memory utilization report, `0.0..=1.0`
    MemoryTelemetry { device_id: String, memory_usage: f64 },
}

impl DeviceEvent {
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Transcript { device_id, .. }
            | Self::ImageCaptured { device_id, .. }
            | Self::PlaybackFinished { device_id, .. }
            | Self::MemoryTelemetry { device_id, .. } => device_id,
        }
    }
}

/// Outbound path to connected devices
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Deliver a message to one device
    ///
    /// # Errors
    ///
    /// Returns error if the device is not connected or the send fails
    async fn send(&self, device_id: &str, message: DeviceMessage) -> Result<()>;

    /// Whether the device currently has a live connection
    fn is_connected(&self, device_id: &str) -> bool;
}

/// Binary payloads travel base64-encoded in JSON frames
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_chunk_frame_shape() {
        let message = DeviceMessage::AudioChunk {
            request_id: "req-1".to_string(),
            data: Bytes::from_static(&[1, 2, 3]),
            sequence: 0,
            total_chunks: 2,
            format: "pcm".to_string(),
            sample_rate: 16_000,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "audio_chunk");
        assert_eq!(json["data"], "AQID");
        assert_eq!(json["total_chunks"], 2);
    }

    #[test]
    fn parses_device_frames() {
        let event: DeviceEvent = serde_json::from_str(
            r#"{"type":"image_captured","device_id":"esp32-1","request_id":"req-1","image":"/9j/"}"#,
        )
        .unwrap();
        let DeviceEvent::ImageCaptured { image, .. } = &event else {
            panic!("expected image frame");
        };
        assert_eq!(image.as_ref(), &[0xFF, 0xD8, 0xFF]);
        assert_eq!(event.device_id(), "esp32-1");

        let event: DeviceEvent =
            serde_json::from_str(r#"{"type":"transcript","device_id":"esp32-1","text":"hi"}"#)
                .unwrap();
        assert!(matches!(event, DeviceEvent::Transcript { request_id: None, .. }));
    }

    #[test]
    fn rejects_bad_base64() {
        let result: std::result::Result<DeviceEvent, _> = serde_json::from_str(
            r#"{"type":"image_captured","device_id":"d","request_id":"r","image":"***"}"#,
        );
        assert!(result.is_err());
    }
}
