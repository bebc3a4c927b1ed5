//! Vision analysis collaborators
//!
//! The orchestrator only sees [`VisionAnalyzer`]. Every call is bounded by a
//! timeout and never retried; failures turn into a fixed fallback answer so
//! provider errors never reach the user.

mod client;

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::recovery::ErrorKind;
use crate::{Error, Result};

pub use client::HttpVisionClient;

/// Answer given to the user when analysis fails
pub const VISION_FALLBACK: &str = "I couldn't analyze the image, please try again";

/// Text answer from a vision model
#[derive(Debug, Clone, PartialEq)]
pub struct VisionAnswer {
    pub text: String,
    pub confidence: Option<f64>,
}

/// Image question answering
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Answer `question` about `image`
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails or returns no text
    async fn analyze(&self, image: &[u8], question: &str, request_id: &str) -> Result<VisionAnswer>;
}

/// Result of a bounded analysis
#[derive(Debug, Clone, PartialEq)]
pub struct VisionOutcome {
    /// Answer text, or [`VISION_FALLBACK`] on failure
    pub text: String,
    pub confidence: Option<f64>,
    /// Failure kind when the fallback was substituted
    pub error: Option<ErrorKind>,
}

impl VisionOutcome {
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn fallback(kind: ErrorKind) -> Self {
        Self {
            text: VISION_FALLBACK.to_string(),
            confidence: None,
            error: Some(kind),
        }
    }
}

/// Run one analysis under `timeout`, degrading failures to the fallback
pub async fn analyze_bounded(
    analyzer: &dyn VisionAnalyzer,
    image: &[u8],
    question: &str,
    request_id: &str,
    timeout: Duration,
) -> VisionOutcome {
    let started = tokio::time::Instant::now();

    match tokio::time::timeout(timeout, analyzer.analyze(image, question, request_id)).await {
        Ok(Ok(answer)) if !answer.text.trim().is_empty() => {
            tracing::info!(
                request_id,
                provider = analyzer.name(),
                elapsed_ms = started.elapsed().as_millis(),
                "vision analysis complete"
            );
            VisionOutcome {
                text: answer.text,
                confidence: answer.confidence,
                error: None,
            }
        }
        Ok(Ok(_)) => {
            tracing::error!(request_id, provider = analyzer.name(), "vision returned empty text");
            VisionOutcome::fallback(ErrorKind::VisionApiError)
        }
        Ok(Err(e)) => {
            tracing::error!(
                request_id,
                provider = analyzer.name(),
                error = %e,
                "vision analysis failed"
            );
            VisionOutcome::fallback(ErrorKind::VisionApiError)
        }
        Err(_) => {
            tracing::error!(
                request_id,
                provider = analyzer.name(),
                timeout_secs = timeout.as_secs_f64(),
                "vision analysis timed out"
            );
            VisionOutcome::fallback(ErrorKind::VisionTimeout)
        }
    }
}

/// Deterministic analyzer for tests and the demo
#[derive(Debug)]
pub struct MockVision {
    answer: String,
    confidence: Option<f64>,
    delay: Duration,
    /// Consumed one per call before the canned answer is returned
    failures: Mutex<VecDeque<String>>,
}

impl MockVision {
    #[must_use]
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            confidence: Some(0.95),
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Simulated provider latency
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next call with `message`
    #[must_use]
    pub fn failing_once(self, message: impl Into<String>) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message.into());
        self
    }
}

#[async_trait]
impl VisionAnalyzer for MockVision {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn analyze(&self, image: &[u8], question: &str, request_id: &str) -> Result<VisionAnswer> {
        tracing::debug!(request_id, bytes = image.len(), question, "mock vision call");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(message) = failure {
            return Err(Error::Vision(message));
        }

        Ok(VisionAnswer {
            text: self.answer.clone(),
            confidence: self.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_answer_through() {
        let vision = MockVision::new("a red apple");
        let outcome =
            analyze_bounded(&vision, b"img", "what is this", "req-1", Duration::from_secs(15)).await;

        assert_eq!(outcome.text, "a red apple");
        assert_eq!(outcome.confidence, Some(0.95));
        assert!(!outcome.is_error());
    }

    #[tokio::test]
    async fn provider_error_becomes_fallback() {
        let vision = MockVision::new("a red apple").failing_once("HTTP 500: upstream exploded");
        let outcome =
            analyze_bounded(&vision, b"img", "what is this", "req-1", Duration::from_secs(15)).await;

        assert_eq!(outcome.text, VISION_FALLBACK);
        assert_eq!(outcome.error, Some(ErrorKind::VisionApiError));
        assert!(!outcome.text.contains("500"));

        // Not retried: the next call succeeds independently
        let next =
            analyze_bounded(&vision, b"img", "what is this", "req-2", Duration::from_secs(15)).await;
        assert!(!next.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let vision = MockVision::new("a red apple").with_delay(Duration::from_secs(30));
        let outcome =
            analyze_bounded(&vision, b"img", "what is this", "req-1", Duration::from_secs(15)).await;

        assert_eq!(outcome.error, Some(ErrorKind::VisionTimeout));
        assert_eq!(outcome.text, VISION_FALLBACK);
    }

    #[tokio::test]
    async fn blank_answer_is_an_error() {
        let vision = MockVision::new("   ");
        let outcome =
            analyze_bounded(&vision, b"img", "what is this", "req-1", Duration::from_secs(15)).await;
        assert_eq!(outcome.error, Some(ErrorKind::VisionApiError));
    }

    #[test]
    fn fallback_matches_taxonomy_message() {
        assert_eq!(VISION_FALLBACK, ErrorKind::VisionApiError.entry().message);
    }
}
