//! Orchestrator - sequences one request from trigger to playback
//!
//! The orchestrator owns every component and watches the whole bus. A
//! detected question runs admission (memory, then the device lock), the
//! capture flow and the vision call on its own task; synthesis and playback
//! react to the bus independently. Every terminal path ends in
//! [`Orchestrator::finish`], which releases the device lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureCoordinator, CaptureStats};
use crate::config::Config;
use crate::events::{BusStats, Event, EventBus, EventPayload};
use crate::playback::{PlaybackCoordinator, PlaybackStats};
use crate::recovery::{ErrorContext, ErrorHandler, ErrorKind};
use crate::request::{RequestContext, RequestState};
use crate::resources::{LockState, MemoryMonitor, ResourceManager};
use crate::speech::{SpeechService, SpeechSynthesizer};
use crate::transport::{DeviceEvent, DeviceTransport};
use crate::trigger::{TriggerDetector, TriggerStats};
use crate::vision::{VisionAnalyzer, analyze_bounded};

/// External services the core talks to
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn DeviceTransport>,
    pub vision: Arc<dyn VisionAnalyzer>,
    pub speech: Arc<dyn SpeechSynthesizer>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("vision", &self.vision.name())
            .field("speech", &self.speech.name())
            .finish_non_exhaustive()
    }
}

/// Snapshot of every component for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub active_requests: usize,
    pub locked_devices: usize,
    pub bus: BusStats,
    pub trigger: TriggerStats,
    pub capture: CaptureStats,
    pub playback: PlaybackStats,
}

/// Wires the components together and drives requests through them
pub struct Orchestrator {
    bus: EventBus,
    errors: ErrorHandler,
    detector: Arc<TriggerDetector>,
    capture: CaptureCoordinator,
    resources: ResourceManager,
    memory: MemoryMonitor,
    playback: Arc<PlaybackCoordinator>,
    speech: Arc<SpeechService>,
    vision: Arc<dyn VisionAnalyzer>,
    vision_timeout: Duration,
    requests: Mutex<HashMap<String, RequestContext>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("vision", &self.vision.name())
            .field("vision_timeout", &self.vision_timeout)
            .field("active_requests", &self.requests().len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build every component from `config` on a fresh bus
    #[must_use]
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let bus = EventBus::new(config.bus.history_size);
        let errors = ErrorHandler::new(bus.clone());

        let detector = Arc::new(TriggerDetector::new(bus.clone(), &config.trigger));
        let capture = CaptureCoordinator::new(
            bus.clone(),
            errors.clone(),
            Arc::clone(&collaborators.transport),
            &config.capture,
        );
        let resources = ResourceManager::new(bus.clone());
        let memory = MemoryMonitor::new(bus.clone(), config.resources.memory_threshold);
        let playback = Arc::new(PlaybackCoordinator::new(
            bus.clone(),
            collaborators.transport,
            &config.playback,
        ));
        let speech = Arc::new(SpeechService::new(
            bus.clone(),
            errors.clone(),
            collaborators.speech,
            config.speech.timeout,
        ));

        tracing::info!(
            vision = collaborators.vision.name(),
            mode = ?config.trigger.mode,
            "orchestrator initialized"
        );

        Self {
            bus,
            errors,
            detector,
            capture,
            resources,
            memory,
            playback,
            speech,
            vision: collaborators.vision,
            vision_timeout: config.vision.timeout,
            requests: Mutex::new(HashMap::new()),
        }
    }

    fn requests(&self) -> std::sync::MutexGuard<'_, HashMap<String, RequestContext>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub const fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    #[must_use]
    pub const fn capture(&self) -> &CaptureCoordinator {
        &self.capture
    }

    #[must_use]
    pub fn playback(&self) -> &PlaybackCoordinator {
        &self.playback
    }

    #[must_use]
    pub fn detector(&self) -> &TriggerDetector {
        &self.detector
    }

    /// Tracking record of an in-flight request
    #[must_use]
    pub fn request(&self, request_id: &str) -> Option<RequestContext> {
        self.requests().get(request_id).cloned()
    }

    /// A device connected; it may now receive audio
    pub fn register_device(&self, device_id: &str) {
        self.playback.register_device(device_id);
    }

    /// A device went away; abandon whatever it was running
    pub fn unregister_device(&self, device_id: &str) {
        self.playback.unregister_device(device_id);

        let abandoned: Vec<String> = self
            .requests()
            .values()
            .filter(|ctx| ctx.device_id == device_id)
            .map(|ctx| ctx.request_id.clone())
            .collect();

        for request_id in abandoned {
            self.capture.cancel_request(&request_id);
            self.finish(&request_id, device_id, RequestState::Error);
        }
    }

    /// Route one inbound device message into the core
    pub fn handle_device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Transcript {
                device_id,
                text,
                request_id,
            } => {
                tracing::debug!(device_id = %device_id, text = %text, "transcript received");
                self.bus.publish(Event::new(
                    request_id,
                    EventPayload::AsrFinal { text, device_id },
                ));
            }
            DeviceEvent::ImageCaptured {
                device_id,
                request_id,
                image,
            } => {
                tracing::debug!(
                    device_id = %device_id,
                    request_id = %request_id,
                    bytes = image.len(),
                    "image from device"
                );
                self.capture.receive_image(&request_id, image);
            }
            DeviceEvent::PlaybackFinished {
                device_id,
                request_id,
            } => {
                self.playback.on_playback_complete(&device_id, &request_id);
            }
            DeviceEvent::MemoryTelemetry {
                device_id,
                memory_usage,
            } => {
                self.memory.update_memory_usage(&device_id, memory_usage);
            }
        }
    }

    /// Run one detected question through admission, capture and vision
    ///
    /// Returns true once a vision answer was published for synthesis. On any
    /// failure the error has been reported and the lock released.
    pub async fn handle_question(&self, request_id: &str, device_id: &str, question: &str) -> bool {
        if !self.memory.check_memory_available(device_id, request_id) {
            self.errors.handle_error(
                ErrorKind::MemoryLow,
                Some(request_id),
                ErrorContext::for_device(device_id),
            );
            return false;
        }

        if !self.resources.acquire_request_lock(request_id, device_id) {
            self.errors.handle_error(
                ErrorKind::ConcurrentLimit,
                Some(request_id),
                ErrorContext::for_device(device_id),
            );
            return false;
        }

        self.requests().insert(
            request_id.to_string(),
            RequestContext::new(request_id, device_id, question),
        );

        self.advance(request_id, RequestState::CaptureRequested);
        if let Err(e) = self
            .capture
            .request_capture(request_id, question, device_id, 0)
            .await
        {
            tracing::debug!(request_id, error = %e, "first capture request failed");
        }
        self.advance(request_id, RequestState::WaitingImage);

        let Some(image) = self.capture.wait_for_image(request_id).await else {
            // Exhaustion was already reported by the capture coordinator
            self.finish(request_id, device_id, RequestState::Error);
            return false;
        };

        self.advance(request_id, RequestState::VisionRunning);
        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::VisionStarted {
                prompt: question.to_string(),
                device_id: device_id.to_string(),
            },
        ));

        let outcome = analyze_bounded(
            self.vision.as_ref(),
            &image,
            question,
            request_id,
            self.vision_timeout,
        )
        .await;

        if outcome.error.is_none() {
            // Playback may start before this task runs again
            self.advance(request_id, RequestState::Synthesizing);
        }

        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::VisionResult {
                text: outcome.text.clone(),
                confidence: outcome.confidence,
                device_id: device_id.to_string(),
                is_error: outcome.is_error(),
            },
        ));

        if let Some(kind) = outcome.error {
            self.errors.handle_error(
                kind,
                Some(request_id),
                ErrorContext::for_device(device_id),
            );
            self.finish(request_id, device_id, RequestState::Error);
            return false;
        }

        true
    }

    fn advance(&self, request_id: &str, state: RequestState) {
        if let Some(ctx) = self.requests().get_mut(request_id) {
            ctx.advance(state);
        }
    }

    /// End a request and release its device lock
    ///
    /// Returns false if the request was not in flight (already finished,
    /// rejected at admission, or an error message being voiced).
    pub fn finish(&self, request_id: &str, device_id: &str, state: RequestState) -> bool {
        let Some(mut ctx) = self.requests().remove(request_id) else {
            return false;
        };
        ctx.advance(state);

        self.resources.release_request_lock(request_id, &ctx.device_id);
        self.errors.reset_retry_count(request_id, None);

        tracing::info!(
            request_id,
            device_id,
            state = %ctx.state,
            elapsed_ms = ctx.triggered_at.elapsed().as_millis(),
            "request finished"
        );
        true
    }

    fn is_active(&self, request_id: Option<&str>) -> bool {
        request_id.is_some_and(|id| self.requests().contains_key(id))
    }

    /// React to one bus event
    ///
    /// Questions are handed to their own task so a capture wait never
    /// stalls the event loop.
    pub fn on_event(self: &Arc<Self>, event: &Event) {
        let request_id = event.request_id();

        match &event.payload {
            EventPayload::AsrFinal { .. } => {
                self.detector.on_transcription(event);
            }
            EventPayload::QuestionDetected {
                question,
                device_id,
                ..
            }
            | EventPayload::TriggerFired {
                trigger_text: question,
                device_id,
                ..
            } => {
                let Some(request_id) = request_id.map(ToString::to_string) else {
                    tracing::warn!(device_id = %device_id, "trigger without request id, ignoring");
                    return;
                };
                let orchestrator = Arc::clone(self);
                let device_id = device_id.clone();
                let question = question.clone();
                tokio::spawn(async move {
                    orchestrator
                        .handle_question(&request_id, &device_id, &question)
                        .await;
                });
            }
            // Voiced admission errors play under request ids that never held a lock
            EventPayload::PlaybackStarted { device_id } if self.is_active(request_id) => {
                let Some(request_id) = request_id else { return };
                self.resources
                    .update_request_state(request_id, device_id, LockState::Playback);
                self.advance(request_id, RequestState::Playing);
            }
            EventPayload::PlaybackComplete { device_id } if self.is_active(request_id) => {
                let Some(request_id) = request_id else { return };
                self.resources
                    .update_request_state(request_id, device_id, LockState::Complete);
                self.finish(request_id, device_id, RequestState::Done);
            }
            EventPayload::PlaybackError { device_id, error } if self.is_active(request_id) => {
                let Some(request_id) = request_id else { return };
                let kind = if error.starts_with("Timeout") {
                    ErrorKind::ConnectionTimeout
                } else {
                    ErrorKind::ConnectionFailed
                };
                self.errors.handle_error(
                    kind,
                    Some(request_id),
                    ErrorContext::for_device(device_id).with_detail(error.clone()),
                );
                self.finish(request_id, device_id, RequestState::Error);
            }
            EventPayload::Error(payload) if payload.error_type.is_synthesis_failure() => {
                if let (Some(request_id), Some(device_id)) = (request_id, &payload.device_id) {
                    self.finish(request_id, device_id, RequestState::Error);
                }
            }
            _ => {}
        }
    }

    /// Watch the whole bus until cancelled
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut subscription = self.bus.subscribe_all();

        tokio::spawn(async move {
            tracing::info!("orchestrator started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => orchestrator.on_event(&event),
                        None => break,
                    },
                }
            }
            drop(subscription);
            tracing::info!("orchestrator stopped");
        })
    }

    /// Start the orchestrator and the listeners it depends on
    ///
    /// Playback and speech run on their own subscriptions. All listeners
    /// stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.playback.spawn(cancel.child_token()),
            self.speech.spawn(cancel.child_token()),
            self.spawn(cancel.child_token()),
        ]
    }

    /// Feed device messages into the core until the channel closes or
    /// `cancel` fires
    pub fn serve_device_events(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DeviceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => orchestrator.handle_device_event(event),
                        None => break,
                    },
                }
            }
            tracing::debug!("device event stream closed");
        })
    }

    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active_requests: self.requests().len(),
            locked_devices: self.resources.active_count(),
            bus: self.bus.stats(),
            trigger: self.detector.stats(),
            capture: self.capture.stats(),
            playback: self.playback.stats(),
        }
    }
}
