//! HTTP vision client (Anthropic messages API)

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{VisionAnalyzer, VisionAnswer};
use crate::capture::{ImageFormat, image_dimensions};
use crate::config::VisionConfig;
use crate::{Error, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 300;

/// Appended to every question to keep answers short enough to speak
const ANSWER_STYLE: &str = "Answer in one or two short spoken sentences.";

/// Answers questions about images through a hosted vision model
pub struct HttpVisionClient {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    endpoint: String,
}

impl std::fmt::Debug for HttpVisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVisionClient")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock<'a> {
    Text { text: String },
    Image { source: ImageSource<'a> },
}

#[derive(Debug, Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    source_type: &'a str,
    media_type: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    text: Option<String>,
}

impl HttpVisionClient {
    /// Build a client from the vision configuration
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured or the HTTP client cannot
    /// be built
    pub fn from_config(config: &VisionConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.expose_secret().is_empty())
            .ok_or_else(|| Error::Config("vision API key required".to_string()))?;

        // The per-call bound is enforced by the caller; this only stops
        // sockets from lingering past it
        let client = reqwest::Client::builder()
            .timeout(config.timeout + std::time::Duration::from_secs(1))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
        })
    }
}

fn media_type(image: &[u8]) -> &'static str {
    match image_dimensions(image) {
        Some((ImageFormat::Png, _, _)) => "image/png",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl VisionAnalyzer for HttpVisionClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn analyze(&self, image: &[u8], question: &str, request_id: &str) -> Result<VisionAnswer> {
        let request = MessageRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64",
                            media_type: media_type(image),
                            data: base64::engine::general_purpose::STANDARD.encode(image),
                        },
                    },
                    ContentBlock::Text {
                        text: format!("{question}\n{ANSWER_STYLE}"),
                    },
                ],
            }],
        };

        tracing::debug!(request_id, model = %self.model, bytes = image.len(), "calling vision API");

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Vision(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Vision(format!("API error {status}: {body}")));
        }

        let result: MessageResponse = response
            .json()
            .await
            .map_err(|e| Error::Vision(format!("Parse error: {e}")))?;

        let text = result
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join(" ");

        if text.trim().is_empty() {
            return Err(Error::Vision("Empty response from vision API".to_string()));
        }

        Ok(VisionAnswer {
            text,
            confidence: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key() {
        let config = VisionConfig::default();
        assert!(matches!(
            HttpVisionClient::from_config(&config),
            Err(Error::Config(_))
        ));

        let config = VisionConfig {
            api_key: Some(SecretString::from(String::new())),
            ..VisionConfig::default()
        };
        assert!(HttpVisionClient::from_config(&config).is_err());
    }

    #[test]
    fn request_body_shape() {
        let request = MessageRequest {
            model: "vision-model",
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64",
                            media_type: "image/jpeg",
                            data: "AAAA".to_string(),
                        },
                    },
                    ContentBlock::Text {
                        text: "what is this".to_string(),
                    },
                ],
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        let content = &json["messages"][0]["content"];
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["type"], "base64");
        assert_eq!(content[1]["type"], "text");
        assert_eq!(content[1]["text"], "what is this");
    }

    #[test]
    fn sniffs_media_type() {
        assert_eq!(media_type(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01"), "image/png");
        assert_eq!(media_type(&[0xFF, 0xD8, 0xFF]), "image/jpeg");
    }
}
