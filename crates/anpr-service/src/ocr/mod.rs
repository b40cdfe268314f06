//! OCR engines.
//!
//! The tracker reads every candidate with a fast local engine; the save
//! dispatcher may re-read the best crop with a slower, more accurate engine
//! before the plate is persisted.

pub mod onnx;
pub mod remote_vision;

use async_trait::async_trait;
use image::RgbImage;
use thiserror::Error;

/// Text read from a plate crop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrReading {
    /// Recognized text, empty when nothing legible was found
    pub text: String,

    /// Engine confidence (0.0 to 1.0)
    pub confidence: f32,
}

impl OcrReading {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine not initialized")]
    NotInitialized,

    #[error("failed to encode plate image: {0}")]
    Encode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("OCR request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("malformed OCR response: {0}")]
    MalformedResponse(String),
}

/// Reads text from a cropped plate image
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine identifier used in logs and metrics (e.g., "onnx_crnn")
    fn name(&self) -> &'static str;

    async fn read(&self, plate: &RgbImage) -> Result<OcrReading, OcrError>;
}

/// Keep only alphanumeric characters, upper-cased
pub fn normalize_plate_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}
