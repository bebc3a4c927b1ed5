//! Audio playback streaming to devices
//!
//! One playback session per device. An `audio.ready` event for a device
//! that is already playing is dropped, not queued, and answered with a
//! `playback.error` for the dropped request. A session starts when
//! streaming starts and ends when the device reports completion or the
//! stream fails; there is no automatic retry.

mod chunk;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PlaybackConfig;
use crate::events::{Event, EventBus, EventKind, EventPayload};
use crate::transport::{DeviceMessage, DeviceTransport};

pub use chunk::{DEFAULT_CHUNK_SIZE, chunk_count, split_chunks};

/// `playback.error` detail for audio dropped because the device is busy
pub const PLAYBACK_BUSY: &str = "Playback already active";

/// The stream currently owning a device's speaker
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub request_id: String,
    pub started_at: Instant,
    pub total_chunks: usize,
}

#[derive(Debug, Default)]
struct PlaybackState {
    sessions: HashMap<String, PlaybackSession>,
    devices: HashSet<String>,
}

/// Playback diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackStats {
    pub active_playback_count: usize,
    pub registered_devices: usize,
    /// device id -> request id
    pub active_playback: HashMap<String, String>,
}

/// Audio waiting to be streamed
#[derive(Debug, Clone)]
struct Stream {
    request_id: String,
    device_id: String,
    audio: Bytes,
    format: String,
    sample_rate: u32,
}

/// Streams synthesized audio to devices, one session per device
pub struct PlaybackCoordinator {
    bus: EventBus,
    transport: Arc<dyn DeviceTransport>,
    chunk_size: usize,
    chunk_delay: Duration,
    stream_timeout: Duration,
    state: Mutex<PlaybackState>,
}

impl std::fmt::Debug for PlaybackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackCoordinator")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_delay", &self.chunk_delay)
            .field("stream_timeout", &self.stream_timeout)
            .finish_non_exhaustive()
    }
}

impl PlaybackCoordinator {
    #[must_use]
    pub fn new(bus: EventBus, transport: Arc<dyn DeviceTransport>, config: &PlaybackConfig) -> Self {
        tracing::info!(
            chunk_size = config.chunk_size,
            chunk_delay_ms = config.chunk_delay.as_millis(),
            stream_timeout_secs = config.stream_timeout.as_secs_f64(),
            "playback coordinator initialized"
        );
        Self {
            bus,
            transport,
            chunk_size: config.chunk_size,
            chunk_delay: config.chunk_delay,
            stream_timeout: config.stream_timeout,
            state: Mutex::new(PlaybackState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a device eligible for playback
    pub fn register_device(&self, device_id: &str) {
        self.state().devices.insert(device_id.to_string());
        tracing::info!(device_id, "device registered for playback");
    }

    /// Forget a device and any session it had
    pub fn unregister_device(&self, device_id: &str) {
        let mut state = self.state();
        state.devices.remove(device_id);
        let dropped = state.sessions.remove(device_id);
        drop(state);

        if let Some(session) = dropped {
            tracing::warn!(
                device_id,
                request_id = %session.request_id,
                "device unregistered during playback"
            );
        } else {
            tracing::info!(device_id, "device unregistered");
        }
    }

    #[must_use]
    pub fn is_playback_active(&self, device_id: &str) -> bool {
        self.state().sessions.contains_key(device_id)
    }

    /// Session currently streaming to `device_id`
    #[must_use]
    pub fn active_session(&self, device_id: &str) -> Option<PlaybackSession> {
        self.state().sessions.get(device_id).cloned()
    }

    /// Handle one `audio.ready` event
    ///
    /// Returns the streaming task when a session was started.
    pub fn on_audio_ready(self: &Arc<Self>, event: &Event) -> Option<JoinHandle<()>> {
        let EventPayload::AudioReady {
            audio,
            format,
            sample_rate,
            device_id,
        } = &event.payload
        else {
            return None;
        };
        let request_id = event.request_id().unwrap_or_default().to_string();
        let total_chunks = chunk_count(audio.len(), self.chunk_size);

        {
            let mut state = self.state();

            if let Some(active) = state.sessions.get(device_id) {
                let active_request_id = active.request_id.clone();
                drop(state);
                tracing::warn!(
                    device_id = %device_id,
                    request_id = %request_id,
                    active_request_id = %active_request_id,
                    "playback already active, dropping audio"
                );
                // The dropped request still needs a terminal playback event
                self.publish_error(device_id, &request_id, PLAYBACK_BUSY);
                return None;
            }

            if !state.devices.contains(device_id.as_str())
                || !self.transport.is_connected(device_id)
            {
                drop(state);
                tracing::error!(
                    device_id = %device_id,
                    request_id = %request_id,
                    "device not connected, cannot stream audio"
                );
                self.publish_error(device_id, &request_id, "Device not connected");
                return None;
            }

            if total_chunks == 0 {
                drop(state);
                tracing::error!(
                    device_id = %device_id,
                    request_id = %request_id,
                    "empty audio, nothing to stream"
                );
                self.publish_error(device_id, &request_id, "Empty audio");
                return None;
            }

            state.sessions.insert(
                device_id.clone(),
                PlaybackSession {
                    request_id: request_id.clone(),
                    started_at: Instant::now(),
                    total_chunks,
                },
            );
        }

        self.bus.publish(Event::for_request(
            &request_id,
            EventPayload::PlaybackStarted {
                device_id: device_id.clone(),
            },
        ));
        tracing::info!(
            device_id = %device_id,
            request_id = %request_id,
            bytes = audio.len(),
            total_chunks,
            "playback started"
        );

        let stream = Stream {
            request_id,
            device_id: device_id.clone(),
            audio: audio.clone(),
            format: format.clone(),
            sample_rate: *sample_rate,
        };
        let coordinator = Arc::clone(self);
        Some(tokio::spawn(async move { coordinator.stream(stream).await }))
    }

    async fn stream(&self, stream: Stream) {
        let chunks = split_chunks(&stream.audio, self.chunk_size);
        let total_chunks = chunks.len();

        for (sequence, data) in chunks.into_iter().enumerate() {
            if !self.owns_session(&stream.device_id, &stream.request_id) {
                tracing::warn!(
                    device_id = %stream.device_id,
                    request_id = %stream.request_id,
                    sequence,
                    "playback session ended mid-stream, aborting"
                );
                return;
            }

            let message = DeviceMessage::AudioChunk {
                request_id: stream.request_id.clone(),
                data,
                sequence,
                total_chunks,
                format: stream.format.clone(),
                sample_rate: stream.sample_rate,
            };

            let sent = tokio::time::timeout(
                self.stream_timeout,
                self.transport.send(&stream.device_id, message),
            )
            .await;
            let failure = match sent {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("Failed to send chunk {sequence}: {e}")),
                Err(_) => Some(format!("Timeout sending chunk {sequence}")),
            };
            if let Some(error) = failure {
                self.fail(&stream.device_id, &stream.request_id, &error);
                return;
            }

            tracing::trace!(
                request_id = %stream.request_id,
                chunk = sequence + 1,
                total_chunks,
                "chunk sent"
            );

            if sequence + 1 < total_chunks {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        tracing::info!(
            device_id = %stream.device_id,
            request_id = %stream.request_id,
            total_chunks,
            "audio streamed, waiting for device to finish"
        );
    }

    fn owns_session(&self, device_id: &str, request_id: &str) -> bool {
        self.state()
            .sessions
            .get(device_id)
            .is_some_and(|session| session.request_id == request_id)
    }

    /// Abort a stream: clear its session and report the failure
    fn fail(&self, device_id: &str, request_id: &str, error: &str) {
        {
            let mut state = self.state();
            if state
                .sessions
                .get(device_id)
                .is_some_and(|session| session.request_id == request_id)
            {
                state.sessions.remove(device_id);
            }
        }
        tracing::error!(device_id, request_id, error, "audio streaming failed");
        self.publish_error(device_id, request_id, error);
    }

    fn publish_error(&self, device_id: &str, request_id: &str, error: &str) {
        self.bus.publish(Event::new(
            (!request_id.is_empty()).then(|| request_id.to_string()),
            EventPayload::PlaybackError {
                device_id: device_id.to_string(),
                error: error.to_string(),
            },
        ));
    }

    /// The device finished playing `request_id`
    ///
    /// Clears the session and publishes `playback.complete`. A report for a
    /// request other than the one currently streaming is ignored.
    pub fn on_playback_complete(&self, device_id: &str, request_id: &str) -> bool {
        {
            let mut state = self.state();
            match state.sessions.get(device_id) {
                Some(session) if session.request_id != request_id => {
                    let active = session.request_id.clone();
                    drop(state);
                    tracing::warn!(
                        device_id,
                        request_id,
                        active_request_id = %active,
                        "completion for a different request, ignoring"
                    );
                    return false;
                }
                Some(session) => {
                    tracing::info!(
                        device_id,
                        request_id,
                        elapsed_ms = session.started_at.elapsed().as_millis(),
                        "playback complete"
                    );
                    state.sessions.remove(device_id);
                }
                None => {
                    tracing::debug!(device_id, request_id, "completion without active session");
                }
            }
        }

        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::PlaybackComplete {
                device_id: device_id.to_string(),
            },
        ));
        true
    }

    /// Stream every `audio.ready` event until cancelled
    ///
    /// Streams already in flight run to completion after cancellation.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut subscription = self.bus.subscribe(EventKind::AudioReady);

        tokio::spawn(async move {
            tracing::info!("playback coordinator started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => {
                            coordinator.on_audio_ready(&event);
                        }
                        None => break,
                    },
                }
            }
            drop(subscription);
            tracing::info!("playback coordinator stopped");
        })
    }

    #[must_use]
    pub fn stats(&self) -> PlaybackStats {
        let state = self.state();
        PlaybackStats {
            active_playback_count: state.sessions.len(),
            registered_devices: state.devices.len(),
            active_playback: state
                .sessions
                .iter()
                .map(|(device, session)| (device.clone(), session.request_id.clone()))
                .collect(),
        }
    }
}
