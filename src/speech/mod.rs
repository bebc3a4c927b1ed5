//! Speech synthesis collaborators
//!
//! [`SpeechSynthesizer`] turns text into device-ready audio. The
//! [`SpeechService`] listens on the bus for answers and error messages,
//! synthesizes them with a single retry, and publishes `audio.ready`.

mod client;
mod service;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Error, Result};

pub use client::HttpSpeechClient;
pub use service::SpeechService;

/// Synthesized audio and how to play it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub audio: Bytes,
    pub format: String,
    pub sample_rate: u32,
}

/// Text-to-speech
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    /// Synthesize `text`
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails or returns no audio
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;
}

/// Bytes of 16-bit mono PCM per character of input
const MOCK_BYTES_PER_CHAR: usize = 320;

/// Deterministic synthesizer producing silent PCM
#[derive(Debug)]
pub struct MockSpeech {
    sample_rate: u32,
    delay: Duration,
    /// Calls left that fail before synthesis succeeds
    failures: Mutex<u32>,
    calls: Mutex<u32>,
}

impl MockSpeech {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            delay: Duration::ZERO,
            failures: Mutex::new(0),
            calls: Mutex::new(0),
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `count` calls
    #[must_use]
    pub fn failing(self, count: u32) -> Self {
        *self.failures.lock().unwrap_or_else(PoisonError::into_inner) = count;
        self
    }

    /// Number of synthesis calls made so far
    #[must_use]
    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSpeech {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Tts("mock synthesis failure".to_string()));
            }
        }

        let len = text.chars().count().max(1) * MOCK_BYTES_PER_CHAR;
        Ok(SynthesizedAudio {
            audio: Bytes::from(vec![0u8; len]),
            format: "pcm".to_string(),
            sample_rate: self.sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_output_scales_with_text() {
        let speech = MockSpeech::new(16_000);
        let short = speech.synthesize("hi").await.unwrap();
        let long = speech.synthesize("a red apple on a table").await.unwrap();

        assert_eq!(short.audio.len(), 2 * MOCK_BYTES_PER_CHAR);
        assert!(long.audio.len() > short.audio.len());
        assert_eq!(long.format, "pcm");
        assert_eq!(long.sample_rate, 16_000);
        assert_eq!(speech.calls(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let speech = MockSpeech::new(16_000).failing(1);
        assert!(speech.synthesize("hello").await.is_err());
        assert!(speech.synthesize("hello").await.is_ok());
    }
}
