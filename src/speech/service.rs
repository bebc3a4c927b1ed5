//! Bus listener that voices answers and error messages

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{SpeechSynthesizer, SynthesizedAudio};
use crate::events::{Event, EventBus, EventKind, EventPayload};
use crate::recovery::{ErrorContext, ErrorHandler, ErrorKind, delay_for_attempt};
use crate::request::new_request_id;

/// Synthesizes `vision.result` answers and `synthesis.required` messages
pub struct SpeechService {
    bus: EventBus,
    errors: ErrorHandler,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    timeout: Duration,
}

impl std::fmt::Debug for SpeechService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechService")
            .field("provider", &self.synthesizer.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SpeechService {
    #[must_use]
    pub fn new(
        bus: EventBus,
        errors: ErrorHandler,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            errors,
            synthesizer,
            timeout,
        }
    }

    /// Voice one event if it carries text for a device
    ///
    /// Error answers in `vision.result` are skipped; the error handler
    /// voices those through `synthesis.required`.
    pub async fn on_event(&self, event: &Event) {
        let (text, device_id) = match &event.payload {
            EventPayload::VisionResult {
                text,
                device_id,
                is_error: false,
                ..
            } => (text, device_id.as_str()),
            EventPayload::SynthesisRequired {
                text,
                device_id: Some(device_id),
                ..
            } => (text, device_id.as_str()),
            EventPayload::SynthesisRequired { text, .. } => {
                tracing::warn!(
                    request_id = event.request_id().unwrap_or("-"),
                    text = %text,
                    "no device to voice message to, skipping"
                );
                return;
            }
            _ => return,
        };

        if text.trim().is_empty() {
            tracing::warn!(
                request_id = event.request_id().unwrap_or("-"),
                "empty text, nothing to say"
            );
            return;
        }

        let request_id = event
            .request_id()
            .map_or_else(new_request_id, ToString::to_string);
        self.speak(&request_id, device_id, text).await;
    }

    /// Synthesize `text` for `device_id`, retrying once on failure
    ///
    /// Publishes `audio.ready` on success; on exhaustion reports
    /// `tts_failed` through the error handler, which never voices it.
    pub async fn speak(&self, request_id: &str, device_id: &str, text: &str) -> bool {
        let kind = ErrorKind::SynthesisFailed;
        let mut attempt = 0;

        loop {
            let synthesis = tokio::time::timeout(self.timeout, self.synthesizer.synthesize(text));
            let failure = match synthesis.await {
                Ok(Ok(audio)) if !audio.audio.is_empty() => {
                    self.errors.reset_retry_count(request_id, Some(&kind));
                    self.publish_audio(request_id, device_id, audio);
                    return true;
                }
                Ok(Ok(_)) => "synthesizer returned no audio".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("synthesis timed out after {}ms", self.timeout.as_millis()),
            };

            tracing::warn!(
                request_id,
                device_id,
                provider = self.synthesizer.name(),
                attempt = attempt + 1,
                error = %failure,
                "synthesis failed"
            );

            if self.errors.should_retry(&kind, request_id) {
                tokio::time::sleep(delay_for_attempt(&kind.entry().retry, attempt)).await;
                attempt += 1;
                continue;
            }

            self.errors.handle_error(
                kind,
                Some(request_id),
                ErrorContext::for_device(device_id)
                    .with_retry_count(attempt)
                    .with_detail(failure),
            );
            return false;
        }
    }

    fn publish_audio(&self, request_id: &str, device_id: &str, audio: SynthesizedAudio) {
        tracing::info!(
            request_id,
            device_id,
            bytes = audio.audio.len(),
            format = %audio.format,
            sample_rate = audio.sample_rate,
            "audio ready"
        );
        self.bus.publish(Event::for_request(
            request_id,
            EventPayload::AudioReady {
                audio: audio.audio,
                format: audio.format,
                sample_rate: audio.sample_rate,
                device_id: device_id.to_string(),
            },
        ));
    }

    /// Listen for text to voice until cancelled
    ///
    /// Each message is synthesized on its own task so a slow provider does
    /// not hold up the next device.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut answers = self.bus.subscribe(EventKind::VisionResult);
        let mut messages = self.bus.subscribe(EventKind::SynthesisRequired);

        tokio::spawn(async move {
            tracing::info!(provider = service.synthesizer.name(), "speech service started");
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = answers.recv() => event,
                    event = messages.recv() => event,
                };
                let Some(event) = event else { break };

                let service = Arc::clone(&service);
                tokio::spawn(async move { service.on_event(&event).await });
            }
            drop(answers);
            drop(messages);
            tracing::info!("speech service stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::MockSpeech;

    fn service(bus: &EventBus, speech: MockSpeech) -> (SpeechService, Arc<MockSpeech>) {
        let speech = Arc::new(speech);
        let service = SpeechService::new(
            bus.clone(),
            ErrorHandler::new(bus.clone()),
            Arc::clone(&speech) as Arc<dyn SpeechSynthesizer>,
            Duration::from_secs(10),
        );
        (service, speech)
    }

    fn answer(text: &str, is_error: bool) -> Event {
        Event::for_request(
            "req-1",
            EventPayload::VisionResult {
                text: text.to_string(),
                confidence: None,
                device_id: "esp32-1".to_string(),
                is_error,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn answer_becomes_audio() {
        let bus = EventBus::default();
        let (service, _) = service(&bus, MockSpeech::new(16_000));

        service.on_event(&answer("a red apple", false)).await;

        let ready = bus.get_history(None, Some(EventKind::AudioReady));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].request_id(), Some("req-1"));
        assert_eq!(ready[0].device_id(), Some("esp32-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn error_answers_are_not_voiced_twice() {
        let bus = EventBus::default();
        let (service, speech) = service(&bus, MockSpeech::new(16_000));

        service.on_event(&answer("fallback", true)).await;

        assert_eq!(speech.calls(), 0);
        assert!(bus.get_history(None, Some(EventKind::AudioReady)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn single_failure_is_retried() {
        let bus = EventBus::default();
        let (service, speech) = service(&bus, MockSpeech::new(16_000).failing(1));

        assert!(service.speak("req-1", "esp32-1", "a red apple").await);
        assert_eq!(speech.calls(), 2);
        assert_eq!(bus.get_history(None, Some(EventKind::AudioReady)).len(), 1);
        assert!(bus.get_history(None, Some(EventKind::Error)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_failure_surfaces_unvoiced_error() {
        let bus = EventBus::default();
        let (service, speech) = service(&bus, MockSpeech::new(16_000).failing(2));

        assert!(!service.speak("req-1", "esp32-1", "a red apple").await);
        assert_eq!(speech.calls(), 2);

        let errors = bus.get_history(None, Some(EventKind::Error));
        assert_eq!(errors.len(), 1);
        let EventPayload::Error(payload) = &errors[0].payload else {
            panic!("expected error payload");
        };
        assert_eq!(payload.error_type, ErrorKind::SynthesisFailed);
        assert_eq!(payload.retry_count, Some(1));
        assert!(bus.get_history(None, Some(EventKind::SynthesisRequired)).is_empty());
        assert!(bus.get_history(None, Some(EventKind::AudioReady)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_counts_as_failure() {
        let bus = EventBus::default();
        let (service, speech) =
            service(&bus, MockSpeech::new(16_000).with_delay(Duration::from_secs(60)));

        assert!(!service.speak("req-1", "esp32-1", "hello").await);
        assert_eq!(speech.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_voices_error_messages() {
        let bus = EventBus::default();
        let (service, _) = service(&bus, MockSpeech::new(16_000));
        let service = Arc::new(service);
        let cancel = CancellationToken::new();
        let mut ready = bus.subscribe(EventKind::AudioReady);
        let handle = service.spawn(cancel.clone());

        bus.publish(Event::for_request(
            "req-7",
            EventPayload::SynthesisRequired {
                text: "Camera unavailable, please try again".to_string(),
                device_id: Some("esp32-1".to_string()),
                prerecorded_file: Some("error_camera.pcm".to_string()),
                is_error_message: true,
            },
        ));

        let event = ready.recv().await.unwrap();
        assert_eq!(event.request_id(), Some("req-7"));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
