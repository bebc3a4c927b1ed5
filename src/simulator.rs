//! Simulated edge device
//!
//! Stands in for the camera/speaker board on an [`InMemoryTransport`]: it
//! answers capture requests with a synthetic JPEG, reassembles audio chunks,
//! and reports playback completion after a configurable playing time.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::{DeviceEvent, DeviceMessage, InMemoryTransport};

/// Frame header, start-of-scan header and end marker
const JPEG_OVERHEAD: usize = 2 + 19 + 10 + 2;

/// Build a baseline JPEG container of exactly `total_len` bytes
///
/// Only the headers are meaningful; the scan data is zero filled. Lengths
/// below the bare container size produce the bare container.
#[must_use]
pub fn synthetic_jpeg(width: u32, height: u32, total_len: usize) -> Vec<u8> {
    let width = u16::try_from(width).unwrap_or(u16::MAX).to_be_bytes();
    let height = u16::try_from(height).unwrap_or(u16::MAX).to_be_bytes();

    let mut data = Vec::with_capacity(total_len.max(JPEG_OVERHEAD));
    // SOI
    data.extend_from_slice(&[0xFF, 0xD8]);
    // SOF0: length 17, 8-bit precision, three components
    data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
    data.extend_from_slice(&height);
    data.extend_from_slice(&width);
    data.extend_from_slice(&[0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);
    // SOS: length 8, one component
    data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
    data.resize(total_len.max(JPEG_OVERHEAD) - 2, 0);
    // EOI
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// Audio the device finished receiving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAudio {
    pub request_id: String,
    pub audio: Bytes,
    pub chunks: usize,
    pub format: String,
    pub sample_rate: u32,
}

#[derive(Debug)]
struct Assembly {
    chunks: Vec<Option<Bytes>>,
    format: String,
    sample_rate: u32,
}

impl Assembly {
    fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }

    fn concat(self) -> Bytes {
        let mut audio = BytesMut::new();
        for chunk in self.chunks.into_iter().flatten() {
            audio.extend_from_slice(&chunk);
        }
        audio.freeze()
    }
}

/// A fake device wired to the in-memory transport
#[derive(Debug)]
pub struct DeviceSimulator {
    device_id: String,
    inbox: Option<mpsc::UnboundedReceiver<DeviceMessage>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    image: Bytes,
    playback_time: Duration,
    ignore_captures: u32,
}

impl DeviceSimulator {
    /// Connect a device to `transport`; its messages go to `events`
    #[must_use]
    pub fn connect(
        device_id: &str,
        transport: &InMemoryTransport,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            inbox: Some(transport.connect(device_id)),
            events,
            image: Bytes::from(synthetic_jpeg(320, 240, 50 * 1024)),
            playback_time: Duration::from_millis(200),
            ignore_captures: 0,
        }
    }

    /// Snapshot sent for every capture request
    #[must_use]
    pub fn with_image(mut self, image: Bytes) -> Self {
        self.image = image;
        self
    }

    /// Time between the last chunk arriving and the finished report
    #[must_use]
    pub const fn with_playback_time(mut self, playback_time: Duration) -> Self {
        self.playback_time = playback_time;
        self
    }

    /// Leave the first `count` capture requests unanswered
    #[must_use]
    pub const fn ignoring_captures(mut self, count: u32) -> Self {
        self.ignore_captures = count;
        self
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Send a finalized transcript as if the user had spoken
    pub fn say(&self, text: &str) -> bool {
        self.send(DeviceEvent::Transcript {
            device_id: self.device_id.clone(),
            text: text.to_string(),
            request_id: None,
        })
    }

    /// Report memory utilization (0.0 to 1.0)
    pub fn report_memory(&self, memory_usage: f64) -> bool {
        self.send(DeviceEvent::MemoryTelemetry {
            device_id: self.device_id.clone(),
            memory_usage,
        })
    }

    fn send(&self, event: DeviceEvent) -> bool {
        if self.events.send(event).is_err() {
            tracing::warn!(device_id = %self.device_id, "device event channel closed");
            return false;
        }
        true
    }

    /// Start answering the backend
    ///
    /// The task ends when the transport disconnects or `cancel` fires and
    /// yields everything the device played. Returns `None` if already
    /// started.
    pub fn spawn(&mut self, cancel: CancellationToken) -> Option<JoinHandle<Vec<ReceivedAudio>>> {
        let inbox = self.inbox.take()?;
        let device = Device {
            device_id: self.device_id.clone(),
            events: self.events.clone(),
            image: self.image.clone(),
            playback_time: self.playback_time,
            ignore_captures: self.ignore_captures,
            assemblies: HashMap::new(),
            played: Vec::new(),
        };
        Some(tokio::spawn(device.run(inbox, cancel)))
    }
}

/// State owned by the running device task
struct Device {
    device_id: String,
    events: mpsc::UnboundedSender<DeviceEvent>,
    image: Bytes,
    playback_time: Duration,
    ignore_captures: u32,
    assemblies: HashMap<String, Assembly>,
    played: Vec<ReceivedAudio>,
}

impl Device {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<DeviceMessage>,
        cancel: CancellationToken,
    ) -> Vec<ReceivedAudio> {
        tracing::info!(device_id = %self.device_id, "simulated device online");
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                message = inbox.recv() => message,
            };
            let Some(message) = message else { break };

            match message {
                DeviceMessage::CaptureRequest {
                    request_id,
                    retry_count,
                } => self.on_capture_request(request_id, retry_count),
                DeviceMessage::AudioChunk {
                    request_id,
                    data,
                    sequence,
                    total_chunks,
                    format,
                    sample_rate,
                } => self.on_chunk(request_id, data, sequence, total_chunks, format, sample_rate),
            }
        }
        tracing::info!(
            device_id = %self.device_id,
            played = self.played.len(),
            "simulated device offline"
        );
        self.played
    }

    fn on_capture_request(&mut self, request_id: String, retry_count: u32) {
        if self.ignore_captures > 0 {
            self.ignore_captures -= 1;
            tracing::debug!(request_id = %request_id, retry_count, "camera busy, ignoring capture");
            return;
        }
        tracing::debug!(request_id = %request_id, retry_count, "snapshot taken");
        if self
            .events
            .send(DeviceEvent::ImageCaptured {
                device_id: self.device_id.clone(),
                request_id,
                image: self.image.clone(),
            })
            .is_err()
        {
            tracing::debug!(device_id = %self.device_id, "event channel closed, snapshot dropped");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_chunk(
        &mut self,
        request_id: String,
        data: Bytes,
        sequence: usize,
        total_chunks: usize,
        format: String,
        sample_rate: u32,
    ) {
        let assembly = self
            .assemblies
            .entry(request_id.clone())
            .or_insert_with(|| Assembly {
                chunks: vec![None; total_chunks],
                format,
                sample_rate,
            });

        let Some(slot) = assembly.chunks.get_mut(sequence) else {
            tracing::warn!(
                request_id = %request_id,
                sequence,
                total_chunks,
                "chunk out of range, dropping"
            );
            return;
        };
        *slot = Some(data);

        if !assembly.is_complete() {
            return;
        }
        let Some(assembly) = self.assemblies.remove(&request_id) else {
            return;
        };

        let received = ReceivedAudio {
            request_id: request_id.clone(),
            chunks: assembly.chunks.len(),
            format: assembly.format.clone(),
            sample_rate: assembly.sample_rate,
            audio: assembly.concat(),
        };
        tracing::debug!(
            request_id = %request_id,
            bytes = received.audio.len(),
            chunks = received.chunks,
            "audio received, playing"
        );
        self.played.push(received);

        let events = self.events.clone();
        let device_id = self.device_id.clone();
        let playback_time = self.playback_time;
        tokio::spawn(async move {
            tokio::time::sleep(playback_time).await;
            let finished = DeviceEvent::PlaybackFinished {
                device_id: device_id.clone(),
                request_id,
            };
            if events.send(finished).is_err() {
                tracing::debug!(device_id = %device_id, "event channel closed, playback report dropped");
            }
        });
    }
}
