/// Plate reader backed by a hosted vision-language model.
///
/// Talks to an OpenAI-compatible chat-completions endpoint. Too slow for every
/// frame; meant as the finalizing engine of the save dispatcher.
use super::{OcrEngine, OcrError, OcrReading};
use async_trait::async_trait;
use base64::Engine;
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const PLATE_PROMPT: &str = "Perform an OCR task on this image. \
Identify the vehicle's license plate and read its characters from left to right. \
Return only the sequence of characters on the plate, with no other text. \
If no plate can be read clearly, respond with exactly: Not Found";

const NOT_FOUND_MARKER: &str = "Not Found";

#[derive(Debug, Clone)]
pub struct RemoteVisionConfig {
    /// Chat-completions endpoint URL
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,

    /// Answers shorter than this (ignoring spaces) are treated as unreadable
    pub min_text_length: usize,

    /// Confidence reported for a successful read
    pub confidence: f32,
}

impl RemoteVisionConfig {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(15),
            min_text_length: 3,
            confidence: 0.95,
        }
    }
}

pub struct RemoteVisionOcr {
    client: Client,
    config: RemoteVisionConfig,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl RemoteVisionOcr {
    pub fn new(config: RemoteVisionConfig) -> Result<Self, OcrError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn encode_data_url(plate: &RgbImage) -> Result<String, OcrError> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(plate)
            .map_err(|e| OcrError::Encode(e.to_string()))?;
        Ok(format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&jpeg)
        ))
    }

    /// Turn the model's free-text answer into plate text
    fn interpret_answer(&self, answer: &str) -> String {
        let answer = answer.trim();
        if answer.contains(NOT_FOUND_MARKER) {
            return String::new();
        }
        let text = answer.to_uppercase();
        if text.chars().filter(|c| !c.is_whitespace()).count() < self.config.min_text_length {
            return String::new();
        }
        text
    }
}

#[async_trait]
impl OcrEngine for RemoteVisionOcr {
    fn name(&self) -> &'static str {
        "remote_vision"
    }

    async fn read(&self, plate: &RgbImage) -> Result<OcrReading, OcrError> {
        let payload = json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PLATE_PROMPT },
                    { "type": "image_url", "image_url": { "url": Self::encode_data_url(plate)? } }
                ]
            }]
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let completion: ChatCompletion = response.json().await?;
        let answer = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| OcrError::MalformedResponse("no message in completion".to_string()))?;

        let text = self.interpret_answer(&answer);
        tracing::debug!(answer = %answer.trim(), text = %text, "remote vision OCR answered");

        if text.is_empty() {
            Ok(OcrReading::empty())
        } else {
            Ok(OcrReading::new(text, self.config.confidence))
        }
    }
}
