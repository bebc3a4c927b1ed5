//! Capture request/response coordination
//!
//! A capture is a request sent to the device followed by a wait for the
//! matching image. Each attempt registers a one-shot completion handle keyed
//! by request id; [`CaptureCoordinator::receive_image`] fulfils it and
//! [`CaptureCoordinator::wait_for_image`] races it against the capture
//! timeout, re-issuing the request until the retry budget is spent.
//!
//! A rejected image (bad header, too large, too many pixels) ends the
//! attempt immediately instead of waiting out the timeout.

mod validate;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::Result;
use crate::config::CaptureConfig;
use crate::events::{ErrorPayload, Event, EventBus, EventPayload};
use crate::recovery::{ErrorContext, ErrorHandler, ErrorKind};
use crate::transport::{DeviceMessage, DeviceTransport};

pub use validate::{ImageFormat, ImageInfo, ImageLimits, image_dimensions, validate_image};

/// How a single attempt resolved, as seen by the waiter
#[derive(Debug)]
enum Outcome {
    Image(Bytes),
    Rejected(ErrorKind, String),
}

#[derive(Debug)]
struct Pending {
    device_id: String,
    question: String,
    retry_count: u32,
    /// Taken by the first image (or transport failure) for this attempt
    tx: Option<oneshot::Sender<Outcome>>,
    /// Taken by the waiter
    rx: Option<oneshot::Receiver<Outcome>>,
}

#[derive(Debug, Default)]
struct CaptureState {
    pending: HashMap<String, Pending>,
    /// Retry counter per request while a capture is in progress
    attempts: HashMap<String, u32>,
}

/// Capture diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStats {
    pub pending: usize,
    pub in_progress: usize,
    pub max_retries: u32,
    pub timeout_ms: u64,
}

/// Requests snapshots from devices and waits for them
pub struct CaptureCoordinator {
    bus: EventBus,
    errors: ErrorHandler,
    transport: Arc<dyn DeviceTransport>,
    limits: ImageLimits,
    timeout: Duration,
    max_retries: u32,
    state: Mutex<CaptureState>,
}

impl std::fmt::Debug for CaptureCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureCoordinator")
            .field("limits", &self.limits)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl CaptureCoordinator {
    #[must_use]
    pub fn new(
        bus: EventBus,
        errors: ErrorHandler,
        transport: Arc<dyn DeviceTransport>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            bus,
            errors,
            transport,
            limits: ImageLimits::from(config),
            timeout: config.timeout,
            max_retries: config.max_retries,
            state: Mutex::new(CaptureState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the device for a snapshot and register the completion handle
    ///
    /// Replaces any stale handle left for `request_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the transport could not deliver the request. The
    /// attempt is already marked failed at that point, so a waiter moves
    /// straight on to the next retry.
    pub async fn request_capture(
        &self,
        request_id: &str,
        question: &str,
        device_id: &str,
        retry_count: u32,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            state.pending.insert(
                request_id.to_string(),
                Pending {
                    device_id: device_id.to_string(),
                    question: question.to_string(),
                    retry_count,
                    tx: Some(tx),
                    rx: Some(rx),
                },
            );
            state.attempts.insert(request_id.to_string(), retry_count);
        }

        tracing::info!(request_id, device_id, retry_count, "requesting capture");

        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::CaptureRequested {
                device_id: device_id.to_string(),
                trigger_text: question.to_string(),
                retry_count,
            },
        ));

        let message = DeviceMessage::CaptureRequest {
            request_id: request_id.to_string(),
            retry_count,
        };
        if let Err(e) = self.transport.send(device_id, message).await {
            tracing::warn!(request_id, device_id, error = %e, "capture request not delivered");
            self.resolve(request_id, Outcome::Rejected(ErrorKind::CaptureFailed, e.to_string()));
            return Err(e);
        }

        Ok(())
    }

    /// Fulfil the pending handle for `request_id`; true if one was waiting
    fn resolve(&self, request_id: &str, outcome: Outcome) -> bool {
        let tx = self
            .state()
            .pending
            .get_mut(request_id)
            .and_then(|pending| pending.tx.take());

        tx.is_some_and(|tx| tx.send(outcome).is_ok())
    }

    /// Wait for the image of an already requested capture, retrying on
    /// timeout or rejection until the budget is spent
    ///
    /// Returns `None` when retries are exhausted (after publishing the
    /// terminal error), when the request was cancelled, or when no capture
    /// was requested for `request_id`.
    pub async fn wait_for_image(&self, request_id: &str) -> Option<Bytes> {
        loop {
            let (rx, device_id, question, retry_count) = {
                let mut state = self.state();
                let pending = state.pending.get_mut(request_id)?;
                let rx = pending.rx.take()?;
                (
                    rx,
                    pending.device_id.clone(),
                    pending.question.clone(),
                    pending.retry_count,
                )
            };

            let (kind, reason) = match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(Outcome::Image(image))) => {
                    let mut state = self.state();
                    state.pending.remove(request_id);
                    state.attempts.remove(request_id);
                    drop(state);
                    return Some(image);
                }
                Ok(Ok(Outcome::Rejected(kind, reason))) => (kind, reason),
                Ok(Err(_)) => {
                    tracing::info!(request_id, "capture cancelled");
                    return None;
                }
                Err(_) => (
                    ErrorKind::CaptureTimeout,
                    format!("no image within {}ms", self.timeout.as_millis()),
                ),
            };

            // Drop the stale handle; a cancel in the meantime ends the wait
            if self.state().pending.remove(request_id).is_none() {
                tracing::info!(request_id, "capture cancelled");
                return None;
            }

            if retry_count < self.max_retries {
                tracing::warn!(
                    request_id,
                    device_id = %device_id,
                    retry_count,
                    max_retries = self.max_retries,
                    error_type = %kind,
                    reason = %reason,
                    "capture attempt failed, retrying"
                );
                self.publish_attempt_failure(request_id, &device_id, &kind, retry_count);

                if let Err(e) = self
                    .request_capture(request_id, &question, &device_id, retry_count + 1)
                    .await
                {
                    tracing::debug!(request_id, error = %e, "retry request failed");
                }
                continue;
            }

            self.state().attempts.remove(request_id);
            tracing::error!(
                request_id,
                device_id = %device_id,
                retry_count,
                error_type = %kind,
                reason = %reason,
                "capture retries exhausted"
            );
            self.errors.handle_error(
                kind,
                Some(request_id),
                ErrorContext::for_device(&device_id)
                    .with_retry_count(retry_count)
                    .with_detail(reason),
            );
            return None;
        }
    }

    /// Diagnostic error for a failed attempt that will be retried; not voiced
    fn publish_attempt_failure(
        &self,
        request_id: &str,
        device_id: &str,
        kind: &ErrorKind,
        retry_count: u32,
    ) {
        let entry = kind.entry();
        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::Error(ErrorPayload {
                error_type: kind.clone(),
                message: entry.message.to_string(),
                prerecorded_file: None,
                retry_count: Some(retry_count),
                device_id: Some(device_id.to_string()),
            }),
        ));
    }

    /// Hand an image from the device to the waiting capture
    ///
    /// Returns false for late, duplicate, unknown or rejected images. A
    /// rejected image still ends the current attempt.
    pub fn receive_image(&self, request_id: &str, image: Bytes) -> bool {
        let device_id = {
            let state = self.state();
            match state.pending.get(request_id) {
                Some(pending) if pending.tx.is_some() => pending.device_id.clone(),
                Some(_) => {
                    tracing::warn!(request_id, "duplicate image for capture, dropping");
                    return false;
                }
                None => {
                    tracing::warn!(request_id, "image for unknown or expired capture, dropping");
                    return false;
                }
            }
        };

        match validate_image(&image, &self.limits) {
            Ok(info) => {
                tracing::info!(
                    request_id,
                    device_id = %device_id,
                    format = info.format.as_str(),
                    width = info.width,
                    height = info.height,
                    bytes = info.size,
                    "image received"
                );
                // Published before the waiter wakes so it precedes anything
                // the waiter publishes next
                self.bus.publish(Event::for_request(
                    request_id,
                    EventPayload::CaptureReceived {
                        device_id,
                        image: image.clone(),
                    },
                ));
                if !self.resolve(request_id, Outcome::Image(image)) {
                    tracing::warn!(request_id, "capture completed concurrently, dropping image");
                    return false;
                }
                true
            }
            Err(e) => {
                tracing::warn!(request_id, device_id = %device_id, error = %e, "image rejected");
                self.resolve(
                    request_id,
                    Outcome::Rejected(ErrorKind::InvalidImage, e.to_string()),
                );
                false
            }
        }
    }

    /// Request a capture and wait for it, with retries
    pub async fn capture(&self, request_id: &str, question: &str, device_id: &str) -> Option<Bytes> {
        if let Err(e) = self.request_capture(request_id, question, device_id, 0).await {
            tracing::debug!(request_id, error = %e, "first capture request failed");
        }
        self.wait_for_image(request_id).await
    }

    /// Abandon a capture; a waiter returns `None` without an error event
    ///
    /// Returns true if a capture was pending
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let mut state = self.state();
        state.attempts.remove(request_id);
        let cancelled = state.pending.remove(request_id).is_some();
        drop(state);

        if cancelled {
            tracing::info!(request_id, "capture request cancelled");
        }
        cancelled
    }

    /// Current retry count for an in-progress capture
    #[must_use]
    pub fn retry_count(&self, request_id: &str) -> Option<u32> {
        self.state().attempts.get(request_id).copied()
    }

    #[must_use]
    pub fn stats(&self) -> CaptureStats {
        let state = self.state();
        CaptureStats {
            pending: state.pending.len(),
            in_progress: state.attempts.len(),
            max_retries: self.max_retries,
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::events::EventKind;
    use crate::simulator::synthetic_jpeg;
    use crate::transport::InMemoryTransport;

    struct Harness {
        bus: EventBus,
        coordinator: Arc<CaptureCoordinator>,
        inbox: mpsc::UnboundedReceiver<DeviceMessage>,
        transport: InMemoryTransport,
    }

    fn harness(max_retries: u32) -> Harness {
        let bus = EventBus::default();
        let transport = InMemoryTransport::new();
        let inbox = transport.connect("esp32-1");
        let config = CaptureConfig {
            max_retries,
            ..CaptureConfig::default()
        };
        let coordinator = Arc::new(CaptureCoordinator::new(
            bus.clone(),
            ErrorHandler::new(bus.clone()),
            Arc::new(transport.clone()),
            &config,
        ));
        Harness {
            bus,
            coordinator,
            inbox,
            transport,
        }
    }

    fn jpeg() -> Bytes {
        Bytes::from(synthetic_jpeg(320, 240, 50 * 1024))
    }

    fn retry_counts(bus: &EventBus, kind: EventKind) -> Vec<Option<u32>> {
        let mut counts: Vec<Option<u32>> = bus
            .get_history(None, Some(kind))
            .iter()
            .map(|event| match &event.payload {
                EventPayload::CaptureRequested { retry_count, .. } => Some(*retry_count),
                EventPayload::Error(payload) => payload.retry_count,
                _ => None,
            })
            .collect();
        counts.reverse();
        counts
    }

    #[tokio::test(start_paused = true)]
    async fn never_answered_capture_exhausts_retries() {
        let h = harness(2);

        let image = h.coordinator.capture("req-1", "what is this", "esp32-1").await;
        assert!(image.is_none());

        assert_eq!(
            retry_counts(&h.bus, EventKind::CaptureRequested),
            vec![Some(0), Some(1), Some(2)]
        );
        // Two diagnostics, then the terminal error with the exhausted count
        assert_eq!(
            retry_counts(&h.bus, EventKind::Error),
            vec![Some(0), Some(1), Some(2)]
        );
        let terminal = &h.bus.get_history(Some(1), Some(EventKind::Error))[0];
        let EventPayload::Error(payload) = &terminal.payload else {
            panic!("expected error payload");
        };
        assert_eq!(payload.error_type, ErrorKind::CaptureTimeout);
        assert_eq!(h.bus.get_history(None, Some(EventKind::SynthesisRequired)).len(), 1);
        assert_eq!(h.coordinator.retry_count("req-1"), None);
        assert_eq!(h.coordinator.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn image_on_retry_stops_further_requests() {
        let Harness {
            bus,
            coordinator,
            mut inbox,
            ..
        } = harness(2);
        let device = Arc::clone(&coordinator);

        tokio::spawn(async move {
            while let Some(DeviceMessage::CaptureRequest {
                request_id,
                retry_count,
            }) = inbox.recv().await
            {
                if retry_count == 1 {
                    device.receive_image(&request_id, jpeg());
                }
            }
        });

        let image = coordinator.capture("req-1", "what is this", "esp32-1").await;
        assert_eq!(image.map(|b| b.len()), Some(50 * 1024));
        assert_eq!(
            retry_counts(&bus, EventKind::CaptureRequested),
            vec![Some(0), Some(1)]
        );
        assert_eq!(bus.get_history(None, Some(EventKind::CaptureReceived)).len(), 1);
        assert!(bus.get_history(None, Some(EventKind::SynthesisRequired)).is_empty());
        assert_eq!(coordinator.retry_count("req-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_image_retries_without_waiting_for_timeout() {
        let Harness {
            bus,
            coordinator,
            mut inbox,
            ..
        } = harness(2);
        let device = Arc::clone(&coordinator);

        tokio::spawn(async move {
            while let Some(DeviceMessage::CaptureRequest {
                request_id,
                retry_count,
            }) = inbox.recv().await
            {
                let image = if retry_count == 0 {
                    Bytes::from(synthetic_jpeg(1280, 960, 8 * 1024))
                } else {
                    jpeg()
                };
                device.receive_image(&request_id, image);
            }
        });

        let started = Instant::now();
        let image = coordinator.capture("req-1", "what is this", "esp32-1").await;

        assert!(image.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
        let errors = bus.get_history(None, Some(EventKind::Error));
        assert_eq!(errors.len(), 1);
        let EventPayload::Error(payload) = &errors[0].payload else {
            panic!("expected error payload");
        };
        assert_eq!(payload.error_type, ErrorKind::InvalidImage);
    }

    #[tokio::test]
    async fn late_and_duplicate_images_are_dropped() {
        let h = harness(2);

        assert!(!h.coordinator.receive_image("req-unknown", jpeg()));

        h.coordinator
            .request_capture("req-1", "what is this", "esp32-1", 0)
            .await
            .unwrap();
        assert!(h.coordinator.receive_image("req-1", jpeg()));
        assert!(!h.coordinator.receive_image("req-1", jpeg()));

        assert!(h.coordinator.wait_for_image("req-1").await.is_some());
        assert!(!h.coordinator.receive_image("req-1", jpeg()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_wait_without_error() {
        let h = harness(2);
        h.coordinator
            .request_capture("req-1", "what is this", "esp32-1", 0)
            .await
            .unwrap();

        let waiter = {
            let coordinator = Arc::clone(&h.coordinator);
            tokio::spawn(async move { coordinator.wait_for_image("req-1").await })
        };
        tokio::task::yield_now().await;

        assert!(h.coordinator.cancel_request("req-1"));
        assert!(waiter.await.unwrap().is_none());
        assert!(h.bus.get_history(None, Some(EventKind::Error)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_device_fails_fast() {
        let h = harness(1);
        h.transport.disconnect("esp32-1");

        let started = Instant::now();
        assert!(h.coordinator.capture("req-1", "what is this", "esp32-1").await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        let terminal = &h.bus.get_history(Some(1), Some(EventKind::Error))[0];
        let EventPayload::Error(payload) = &terminal.payload else {
            panic!("expected error payload");
        };
        assert_eq!(payload.error_type, ErrorKind::CaptureFailed);
        assert_eq!(payload.retry_count, Some(1));
    }

    #[tokio::test]
    async fn waiting_without_request_returns_none() {
        let h = harness(2);
        assert!(h.coordinator.wait_for_image("req-1").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capture_received_precedes_waiter_follow_up() {
        let h = harness(2);
        h.coordinator
            .request_capture("req-1", "what is this", "esp32-1", 0)
            .await
            .unwrap();

        let waiter = {
            let coordinator = Arc::clone(&h.coordinator);
            let bus = h.bus.clone();
            tokio::spawn(async move {
                let image = coordinator.wait_for_image("req-1").await;
                bus.publish(Event::for_request(
                    "req-1",
                    EventPayload::VisionStarted {
                        prompt: "what is this".to_string(),
                        device_id: "esp32-1".to_string(),
                    },
                ));
                image
            })
        };

        assert!(h.coordinator.receive_image("req-1", jpeg()));
        assert!(waiter.await.unwrap().is_some());

        let order: Vec<EventKind> = h
            .bus
            .get_history(None, None)
            .iter()
            .rev()
            .map(|event| event.kind())
            .filter(|kind| matches!(kind, EventKind::CaptureReceived | EventKind::VisionStarted))
            .collect();
        assert_eq!(order, [EventKind::CaptureReceived, EventKind::VisionStarted]);
    }
}
