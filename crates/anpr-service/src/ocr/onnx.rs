/// CRNN plate reader running on ONNX Runtime.
///
/// The model takes a single-channel crop resized to a fixed input size and
/// emits per-timestep probabilities over the character vocabulary; text is
/// recovered with greedy CTC decoding (blank at index 0).
use super::{normalize_plate_text, OcrEngine, OcrError, OcrReading};
use crate::inference::{create_session, OnnxRuntimeConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array, IxDyn};
use ort::{session::Session, value::Value};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxOcrConfig {
    /// Path to the OCR ONNX model file
    pub model_path: String,

    /// OCR model input width
    #[serde(default = "default_input_width")]
    pub input_width: u32,

    /// OCR model input height
    #[serde(default = "default_input_height")]
    pub input_height: u32,

    /// Character vocabulary, CTC blank excluded
    #[serde(default = "default_char_vocab")]
    pub char_vocab: String,

    /// Reads below this mean character confidence are reported as empty
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    #[serde(default)]
    pub runtime: OnnxRuntimeConfig,
}

fn default_input_width() -> u32 {
    200
}

fn default_input_height() -> u32 {
    64
}

fn default_char_vocab() -> String {
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-".to_string()
}

fn default_min_confidence() -> f32 {
    0.3
}

impl Default for OnnxOcrConfig {
    fn default() -> Self {
        Self {
            model_path: "models/lpr_ocr.onnx".to_string(),
            input_width: default_input_width(),
            input_height: default_input_height(),
            char_vocab: default_char_vocab(),
            min_confidence: default_min_confidence(),
            runtime: OnnxRuntimeConfig::default(),
        }
    }
}

pub struct OnnxOcrEngine {
    config: OnnxOcrConfig,
    vocab: Vec<char>,
    session: Option<Mutex<Session>>,
}

impl OnnxOcrEngine {
    /// Create an engine without loading the model
    pub fn new(config: OnnxOcrConfig) -> Self {
        let vocab = config.char_vocab.chars().collect();
        Self {
            config,
            vocab,
            session: None,
        }
    }

    /// Create an engine and load its model
    pub fn load(config: OnnxOcrConfig) -> Result<Self> {
        let mut engine = Self::new(config);
        let (session, provider) = create_session(&engine.config.model_path, &engine.config.runtime)?;
        tracing::info!(
            model = %engine.config.model_path,
            provider = %provider,
            "loaded plate OCR model"
        );
        engine.session = Some(Mutex::new(session));
        Ok(engine)
    }

    /// Grayscale, resize and normalize to an NCHW tensor in [0, 1]
    fn preprocess(&self, plate: &RgbImage) -> Array<f32, IxDyn> {
        let width = self.config.input_width;
        let height = self.config.input_height;
        let gray = DynamicImage::ImageRgb8(plate.clone())
            .resize_exact(width, height, FilterType::Triangle)
            .to_luma8();

        let mut input = Array::zeros(IxDyn(&[1, 1, height as usize, width as usize]));
        for (x, y, pixel) in gray.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        }
        input
    }

    fn infer(&self, plate: &RgbImage) -> Result<OcrReading> {
        let session_lock = self.session.as_ref().context("OCR model not initialized")?;

        let input_tensor = Value::from_array(self.preprocess(plate))?;
        let mut session = session_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock OCR session: {}", e))?;
        let outputs = session.run(ort::inputs![input_tensor])?;

        // Expected shape: [batch, sequence_length, vocab_size + 1]
        let output_value = outputs
            .get("output")
            .or_else(|| outputs.get("output0"))
            .or_else(|| outputs.get("logits"))
            .context("No OCR output tensor found (tried: output, output0, logits)")?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;
        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output = Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?;

        let (raw, confidence) = self.ctc_decode(&output)?;
        let text = normalize_plate_text(&raw);
        if text.is_empty() || confidence < self.config.min_confidence {
            return Ok(OcrReading::empty());
        }
        Ok(OcrReading::new(text, confidence))
    }

    /// Greedy CTC decoding.
    ///
    /// Returns the decoded string and the mean probability of the emitted characters.
    fn ctc_decode(&self, output: &Array<f32, IxDyn>) -> Result<(String, f32)> {
        if output.ndim() != 3 {
            anyhow::bail!("unexpected OCR output rank {}", output.ndim());
        }
        let sequence_length = output.shape()[1];
        let vocab_size = output.shape()[2];

        let mut text = String::new();
        let mut prob_sum = 0.0f32;
        let mut prev_idx = 0usize;

        for t in 0..sequence_length {
            let mut max_prob = output[[0, t, 0]];
            let mut max_idx = 0;
            for c in 1..vocab_size {
                let prob = output[[0, t, c]];
                if prob > max_prob {
                    max_prob = prob;
                    max_idx = c;
                }
            }

            if max_idx > 0 && max_idx != prev_idx {
                if let Some(ch) = self.vocab.get(max_idx - 1) {
                    text.push(*ch);
                    prob_sum += max_prob;
                }
            }
            prev_idx = max_idx;
        }

        let emitted = text.chars().count();
        let confidence = if emitted == 0 {
            0.0
        } else {
            prob_sum / emitted as f32
        };
        Ok((text, confidence))
    }
}

#[async_trait]
impl OcrEngine for OnnxOcrEngine {
    fn name(&self) -> &'static str {
        "onnx_crnn"
    }

    async fn read(&self, plate: &RgbImage) -> Result<OcrReading, OcrError> {
        if self.session.is_none() {
            return Err(OcrError::NotInitialized);
        }
        if plate.width() == 0 || plate.height() == 0 {
            return Ok(OcrReading::empty());
        }
        self.infer(plate)
            .map_err(|e| OcrError::Inference(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probabilities(vocab_size: usize, hot: &[usize]) -> Array<f32, IxDyn> {
        let mut data = vec![0.01f32; hot.len() * vocab_size];
        for (t, idx) in hot.iter().enumerate() {
            data[t * vocab_size + idx] = 0.9;
        }
        Array::from_shape_vec(IxDyn(&[1, hot.len(), vocab_size]), data)
            .expect("valid test tensor")
    }

    #[test]
    fn test_config_defaults() {
        let config = OnnxOcrConfig::default();
        assert_eq!(config.input_width, 200);
        assert_eq!(config.input_height, 64);
        assert!(config.char_vocab.contains("0123456789"));
        assert!(config.char_vocab.contains("ABCDEFGHIJKLMNOPQRSTUVWXYZ"));
    }

    #[test]
    fn test_ctc_decode_collapses_repeats_and_blanks() {
        let engine = OnnxOcrEngine::new(OnnxOcrConfig::default());
        let vocab_size = engine.vocab.len() + 1;

        // blank, A, A, blank, A, B, 1
        let output = probabilities(vocab_size, &[0, 11, 11, 0, 11, 12, 2]);
        let (text, confidence) = engine.ctc_decode(&output).expect("decode");
        assert_eq!(text, "AAB1");
        assert!((confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_ctc_decode_all_blank() {
        let engine = OnnxOcrEngine::new(OnnxOcrConfig::default());
        let vocab_size = engine.vocab.len() + 1;
        let output = probabilities(vocab_size, &[0, 0, 0]);
        let (text, confidence) = engine.ctc_decode(&output).expect("decode");
        assert!(text.is_empty());
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_preprocess_shape() {
        let engine = OnnxOcrEngine::new(OnnxOcrConfig::default());
        let input = engine.preprocess(&RgbImage::new(120, 30));
        assert_eq!(input.shape(), &[1, 1, 64, 200]);
    }

    #[tokio::test]
    async fn test_read_fails_when_uninitialized() {
        let engine = OnnxOcrEngine::new(OnnxOcrConfig::default());
        let result = engine.read(&RgbImage::new(120, 30)).await;
        assert!(matches!(result, Err(OcrError::NotInitialized)));
    }

    #[test]
    fn test_load_fails_for_missing_model() {
        let config = OnnxOcrConfig {
            model_path: "models/does_not_exist.onnx".to_string(),
            ..OnnxOcrConfig::default()
        };
        assert!(OnnxOcrEngine::load(config).is_err());
    }
}
