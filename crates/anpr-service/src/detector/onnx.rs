/// Single-class YOLOv8 plate detector running on ONNX Runtime
use super::{DetectorError, PlateDetector};
use crate::geometry::iou;
use crate::inference::{create_session, OnnxRuntimeConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::plates::PlateBox;
use image::{imageops::FilterType, GrayImage};
use ndarray::{Array, IxDyn};
use ort::{session::Session, value::Value};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxDetectorConfig {
    /// Path to the plate detection ONNX model file
    pub model_path: String,

    /// Confidence threshold for plate detections (0.0 to 1.0)
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,

    /// IoU threshold for non-maximum suppression
    #[serde(default = "default_nms_iou")]
    pub nms_iou_threshold: f32,

    /// Maximum number of plates reported per frame
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,

    /// Model input size (width and height)
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    #[serde(default)]
    pub runtime: OnnxRuntimeConfig,
}

fn default_confidence() -> f32 {
    0.6
}

fn default_nms_iou() -> f32 {
    0.4
}

fn default_max_detections() -> usize {
    10
}

fn default_input_size() -> u32 {
    640
}

impl Default for OnnxDetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/lpr_detector.onnx".to_string(),
            confidence_threshold: default_confidence(),
            nms_iou_threshold: default_nms_iou(),
            max_detections: default_max_detections(),
            input_size: default_input_size(),
            runtime: OnnxRuntimeConfig::default(),
        }
    }
}

pub struct OnnxPlateDetector {
    config: OnnxDetectorConfig,
    session: Option<Mutex<Session>>,
}

impl OnnxPlateDetector {
    /// Create a detector without loading the model
    pub fn new(config: OnnxDetectorConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Create a detector and load its model
    pub fn load(config: OnnxDetectorConfig) -> Result<Self> {
        let mut detector = Self::new(config);
        let (session, provider) =
            create_session(&detector.config.model_path, &detector.config.runtime)?;
        tracing::info!(
            model = %detector.config.model_path,
            provider = %provider,
            device = detector.config.runtime.device_id,
            "loaded plate detection model"
        );
        detector.session = Some(Mutex::new(session));
        Ok(detector)
    }

    /// Resize and replicate the gray channel into an NCHW RGB tensor in [0, 1]
    fn preprocess(&self, frame: &GrayImage) -> Array<f32, IxDyn> {
        let size = self.config.input_size;
        let resized = image::imageops::resize(frame, size, size, FilterType::Triangle);

        let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let v = pixel[0] as f32 / 255.0;
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = v;
            }
        }
        input
    }

    /// Greedy non-maximum suppression, highest confidence first
    fn nms(&self, mut boxes: Vec<(PlateBox, f32)>) -> Vec<(PlateBox, f32)> {
        boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut keep: Vec<(PlateBox, f32)> = Vec::new();
        for candidate in boxes {
            if keep
                .iter()
                .all(|kept| iou(&kept.0, &candidate.0) < self.config.nms_iou_threshold)
            {
                keep.push(candidate);
            }
        }
        keep
    }

    /// Decode YOLOv8 output `[batch, 5, num_predictions]` (cx, cy, w, h, conf)
    fn postprocess(
        &self,
        output: &Array<f32, IxDyn>,
        original_width: u32,
        original_height: u32,
    ) -> Result<Vec<PlateBox>> {
        if output.ndim() != 3 || output.shape()[1] < 5 {
            anyhow::bail!("unexpected detector output shape {:?}", output.shape());
        }

        let scale_x = original_width as f32 / self.config.input_size as f32;
        let scale_y = original_height as f32 / self.config.input_size as f32;
        let num_predictions = output.shape()[2];

        let mut boxes = Vec::new();
        for i in 0..num_predictions {
            let confidence = output[[0, 4, i]];
            if confidence < self.config.confidence_threshold {
                continue;
            }

            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let w = output[[0, 2, i]];
            let h = output[[0, 3, i]];

            let x = ((cx - w / 2.0) * scale_x).max(0.0) as u32;
            let y = ((cy - h / 2.0) * scale_y).max(0.0) as u32;
            let width = (w * scale_x).min(original_width as f32) as u32;
            let height = (h * scale_y).min(original_height as f32) as u32;

            if let Some(bbox) =
                PlateBox::new(x, y, width, height).clamp_to(original_width, original_height)
            {
                boxes.push((bbox, confidence));
            }
        }

        Ok(self
            .nms(boxes)
            .into_iter()
            .take(self.config.max_detections)
            .map(|(bbox, _)| bbox)
            .collect())
    }

    fn infer(&self, frame: &GrayImage) -> Result<Vec<PlateBox>> {
        let session_lock = self
            .session
            .as_ref()
            .context("Detection model not initialized")?;

        let input_tensor = Value::from_array(self.preprocess(frame))?;
        let mut session = session_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock detection session: {}", e))?;
        let outputs = session.run(ort::inputs![input_tensor])?;

        let output_value = outputs
            .get("output0")
            .or_else(|| outputs.get("output"))
            .or_else(|| outputs.get("boxes"))
            .context("No detection output tensor found (tried: output0, output, boxes)")?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;
        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output = Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?;

        self.postprocess(&output, frame.width(), frame.height())
    }
}

#[async_trait]
impl PlateDetector for OnnxPlateDetector {
    fn name(&self) -> &'static str {
        "onnx_yolov8_plate"
    }

    async fn detect(&self, frame: &GrayImage) -> Result<Vec<PlateBox>, DetectorError> {
        if self.session.is_none() {
            return Err(DetectorError::NotInitialized);
        }
        self.infer(frame)
            .map_err(|e| DetectorError::Inference(format!("{:#}", e)))
    }
}
