//! HTTP speech client (`OpenAI` speech API)

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{SpeechSynthesizer, SynthesizedAudio};
use crate::config::SpeechConfig;
use crate::{Error, Result};

/// Synthesizes speech through a hosted TTS endpoint
pub struct HttpSpeechClient {
    client: reqwest::Client,
    api_key: SecretString,
    endpoint: String,
    model: String,
    voice: String,
    format: String,
    sample_rate: u32,
}

impl std::fmt::Debug for HttpSpeechClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSpeechClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl HttpSpeechClient {
    /// Build a client from the speech configuration
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured or the HTTP client cannot
    /// be built
    pub fn from_config(config: &SpeechConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.expose_secret().is_empty())
            .ok_or_else(|| Error::Config("TTS API key required".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout + std::time::Duration::from_secs(1))
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            format: config.format.clone(),
            sample_rate: config.sample_rate,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: &self.format,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(Error::Tts("TTS returned no audio".to_string()));
        }

        tracing::debug!(bytes = audio.len(), chars = text.chars().count(), "speech synthesized");
        Ok(SynthesizedAudio {
            audio,
            format: self.format.clone(),
            sample_rate: self.sample_rate,
        })
    }
}
