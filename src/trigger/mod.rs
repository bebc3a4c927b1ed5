//! Trigger phrase detection
//!
//! Watches finalized transcriptions for a configured phrase and, outside the
//! cooldown window, publishes the event that starts a capture-and-answer
//! request. Two flavours share one detector:
//!
//! - [`TriggerMode::Keyword`]: exact, case-insensitive substring match;
//!   publishes `trigger.fired`
//! - [`TriggerMode::Question`]: exact match, then partial fuzzy match against
//!   the threshold; publishes `question.detected`
//!
//! Phrases are scanned in configuration order and the first phrase that
//! matches wins, even if a later phrase would score higher.

mod fuzzy;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TriggerConfig;
use crate::events::{Event, EventBus, EventKind, EventPayload};
use crate::request::new_request_id;

pub use fuzzy::{partial_ratio, ratio};

/// Which detector flavour to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Exact keywords only
    Keyword,
    /// Exact then fuzzy question phrases
    #[default]
    Question,
}

/// A recognized trigger phrase
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    /// Phrase as configured
    pub phrase: String,
    /// 1.0 for exact matches, similarity score for fuzzy ones
    pub confidence: f64,
    /// Byte offset of an exact match in the lowercased transcript
    pub position: Option<usize>,
}

#[derive(Debug, Default)]
struct CooldownState {
    last_trigger: Option<Instant>,
    active_request_id: Option<String>,
}

/// Detector statistics for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct TriggerStats {
    pub mode: TriggerMode,
    pub cooldown_active: bool,
    pub active_request_id: Option<String>,
    pub trigger_count: usize,
}

/// Recognizes trigger phrases and enforces the cooldown
#[derive(Debug)]
pub struct TriggerDetector {
    bus: EventBus,
    mode: TriggerMode,
    /// (original phrase, lowercased phrase)
    phrases: Vec<(String, String)>,
    fuzzy_threshold: f64,
    cooldown: Duration,
    state: Mutex<CooldownState>,
}

impl TriggerDetector {
    #[must_use]
    pub fn new(bus: EventBus, config: &TriggerConfig) -> Self {
        let phrases: Vec<(String, String)> = config
            .phrases()
            .map(|p| (p.to_string(), p.trim().to_lowercase()))
            .filter(|(_, lower)| !lower.is_empty())
            .collect();

        tracing::info!(
            mode = ?config.mode,
            phrases = phrases.len(),
            cooldown_secs = config.cooldown.as_secs_f64(),
            threshold = config.fuzzy_threshold,
            "trigger detector initialized"
        );

        Self {
            bus,
            mode: config.mode,
            phrases,
            fuzzy_threshold: config.fuzzy_threshold,
            cooldown: config.cooldown,
            state: Mutex::new(CooldownState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CooldownState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the first configured phrase present in `text`
    ///
    /// Exact matches on any phrase win over fuzzy ones; within each pass the
    /// configured order decides.
    #[must_use]
    pub fn detect(&self, text: &str) -> Option<TriggerMatch> {
        let text_lower = text.to_lowercase();

        let exact = self.phrases.iter().find_map(|(phrase, phrase_lower)| {
            text_lower
                .find(phrase_lower.as_str())
                .map(|position| TriggerMatch {
                    phrase: phrase.clone(),
                    confidence: 1.0,
                    position: Some(position),
                })
        });
        if exact.is_some() || self.mode != TriggerMode::Question {
            return exact;
        }

        self.phrases.iter().find_map(|(phrase, phrase_lower)| {
            let confidence = partial_ratio(phrase_lower, &text_lower);
            (confidence >= self.fuzzy_threshold).then(|| TriggerMatch {
                phrase: phrase.clone(),
                confidence,
                position: None,
            })
        })
    }

    /// Whether a trigger fired less than the cooldown ago
    #[must_use]
    pub fn is_cooldown_active(&self) -> bool {
        self.state()
            .last_trigger
            .is_some_and(|at| at.elapsed() < self.cooldown)
    }

    /// Forget the last trigger so the next phrase fires immediately
    pub fn reset_cooldown(&self) {
        let mut state = self.state();
        state.last_trigger = None;
        state.active_request_id = None;
        tracing::debug!("cooldown reset");
    }

    /// Handle one `asr.final` event
    ///
    /// Returns the request id of the published trigger event, if any.
    pub fn on_transcription(&self, event: &Event) -> Option<String> {
        let EventPayload::AsrFinal { text, device_id } = &event.payload else {
            return None;
        };
        if text.trim().is_empty() {
            return None;
        }

        // Claim the cooldown window before publishing so two transcripts
        // racing through here cannot both fire
        let mut state = self.state();
        if state
            .last_trigger
            .is_some_and(|at| at.elapsed() < self.cooldown)
        {
            tracing::debug!(text = %text, "cooldown active, ignoring transcription");
            return None;
        }

        let trigger = self.detect(text)?;
        let request_id = event
            .request_id()
            .map_or_else(new_request_id, ToString::to_string);

        state.last_trigger = Some(Instant::now());
        state.active_request_id = Some(request_id.clone());
        drop(state);

        tracing::info!(
            request_id = %request_id,
            device_id = %device_id,
            phrase = %trigger.phrase,
            confidence = trigger.confidence,
            "trigger detected"
        );

        let payload = match self.mode {
            TriggerMode::Keyword => EventPayload::TriggerFired {
                trigger_text: text.clone(),
                matched_keyword: trigger.phrase,
                device_id: device_id.clone(),
            },
            TriggerMode::Question => EventPayload::QuestionDetected {
                question: text.clone(),
                device_id: device_id.clone(),
                confidence: trigger.confidence,
            },
        };
        self.bus.publish(Event::for_request(&request_id, payload));

        Some(request_id)
    }

    /// Run the detector on its own bus subscription until cancelled
    ///
    /// Cancellation drops the subscription; a transcription being handled
    /// at that moment finishes first.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        let mut subscription = self.bus.subscribe(EventKind::AsrFinal);

        tokio::spawn(async move {
            tracing::info!("trigger detector started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => {
                            detector.on_transcription(&event);
                        }
                        None => break,
                    },
                }
            }
            drop(subscription);
            tracing::info!("trigger detector stopped");
        })
    }

    #[must_use]
    pub fn stats(&self) -> TriggerStats {
        let cooldown_active = self.is_cooldown_active();
        TriggerStats {
            mode: self.mode,
            cooldown_active,
            active_request_id: self.state().active_request_id.clone(),
            trigger_count: self.phrases.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: TriggerMode) -> TriggerConfig {
        TriggerConfig {
            mode,
            english_triggers: vec!["what do I see".to_string(), "what is this".to_string()],
            chinese_triggers: vec!["这是什么".to_string()],
            cooldown: Duration::from_secs(3),
            fuzzy_threshold: 0.85,
        }
    }

    fn asr(text: &str) -> Event {
        Event::new(
            None,
            EventPayload::AsrFinal {
                text: text.to_string(),
                device_id: "esp32-1".to_string(),
            },
        )
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let detector = TriggerDetector::new(EventBus::default(), &config(TriggerMode::Keyword));
        let found = detector.detect("Hey, WHAT IS THIS?").unwrap();
        assert_eq!(found.phrase, "what is this");
        assert!((found.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(found.position, Some(5));
    }

    #[test]
    fn keyword_mode_skips_fuzzy_matching() {
        let detector = TriggerDetector::new(EventBus::default(), &config(TriggerMode::Keyword));
        assert!(detector.detect("whot is this").is_none());
    }

    #[test]
    fn question_mode_accepts_near_misses() {
        let detector = TriggerDetector::new(EventBus::default(), &config(TriggerMode::Question));
        let found = detector.detect("whot is this").unwrap();
        assert_eq!(found.phrase, "what is this");
        assert!(found.confidence >= 0.85 && found.confidence < 1.0);
        assert_eq!(found.position, None);
    }

    #[test]
    fn first_phrase_in_list_order_wins() {
        let mut cfg = config(TriggerMode::Question);
        cfg.english_triggers = vec!["what is".to_string(), "what is this".to_string()];
        let detector = TriggerDetector::new(EventBus::default(), &cfg);

        assert_eq!(detector.detect("what is this").unwrap().phrase, "what is");
    }

    #[test]
    fn exact_match_beats_earlier_fuzzy_phrase() {
        let detector = TriggerDetector::new(EventBus::default(), &config(TriggerMode::Question));
        let found = detector.detect("whot do i see, what is this").unwrap();
        assert_eq!(found.phrase, "what is this");
        assert!((found.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(found.position, Some(15));
    }

    #[test]
    fn unrelated_text_does_not_trigger() {
        let detector = TriggerDetector::new(EventBus::default(), &config(TriggerMode::Question));
        assert!(detector.detect("turn the volume down please").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_question_with_full_text() {
        let bus = EventBus::default();
        let detector = TriggerDetector::new(bus.clone(), &config(TriggerMode::Question));

        let request_id = detector.on_transcription(&asr("what do I see")).unwrap();

        let events = bus.get_history(None, Some(EventKind::QuestionDetected));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id(), Some(request_id.as_str()));
        let EventPayload::QuestionDetected {
            question,
            device_id,
            ..
        } = &events[0].payload
        else {
            panic!("expected question payload");
        };
        assert_eq!(question, "what do I see");
        assert_eq!(device_id, "esp32-1");
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_mode_publishes_trigger_fired() {
        let bus = EventBus::default();
        let detector = TriggerDetector::new(bus.clone(), &config(TriggerMode::Keyword));

        detector.on_transcription(&asr("这是什么"));

        let events = bus.get_history(None, Some(EventKind::TriggerFired));
        assert_eq!(events.len(), 1);
        let EventPayload::TriggerFired {
            matched_keyword, ..
        } = &events[0].payload
        else {
            panic!("expected trigger payload");
        };
        assert_eq!(matched_keyword, "这是什么");
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_supplied_request_id() {
        let bus = EventBus::default();
        let detector = TriggerDetector::new(bus, &config(TriggerMode::Question));

        let mut event = asr("what is this");
        event.request_id = Some("asr-42".to_string());

        assert_eq!(detector.on_transcription(&event).as_deref(), Some("asr-42"));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_then_releases() {
        let bus = EventBus::default();
        let detector = TriggerDetector::new(bus.clone(), &config(TriggerMode::Question));

        assert!(detector.on_transcription(&asr("what is this")).is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(detector.on_transcription(&asr("what is this")).is_none());
        assert!(detector.is_cooldown_active());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!detector.is_cooldown_active());
        assert!(detector.on_transcription(&asr("what is this")).is_some());

        assert_eq!(bus.get_history(None, Some(EventKind::QuestionDetected)).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cooldown_allows_immediate_trigger() {
        let detector = TriggerDetector::new(EventBus::default(), &config(TriggerMode::Question));
        detector.on_transcription(&asr("what is this"));
        detector.reset_cooldown();
        assert!(detector.on_transcription(&asr("what is this")).is_some());
    }

    #[tokio::test]
    async fn empty_transcripts_are_ignored() {
        let detector = TriggerDetector::new(EventBus::default(), &config(TriggerMode::Question));
        assert!(detector.on_transcription(&asr("   ")).is_none());
        assert!(!detector.is_cooldown_active());
    }

    #[tokio::test]
    async fn listener_unsubscribes_on_cancel() {
        let bus = EventBus::default();
        let detector = Arc::new(TriggerDetector::new(bus.clone(), &config(TriggerMode::Question)));
        let cancel = CancellationToken::new();

        let handle = detector.spawn(cancel.clone());
        assert_eq!(bus.subscriber_count(), 1);

        let mut questions = bus.subscribe(EventKind::QuestionDetected);
        bus.publish(asr("what is this"));
        assert!(questions.recv().await.is_some());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.stats().topics, vec!["question.detected".to_string()]);
    }
}
