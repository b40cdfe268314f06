//! Plate region detection.

pub mod onnx;

use async_trait::async_trait;
use common::plates::PlateBox;
use image::GrayImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector not initialized")]
    NotInitialized,

    #[error("detection failed: {0}")]
    Inference(String),
}

/// Finds candidate plate regions in a grayscale frame.
///
/// False positives and missed plates are expected; the tracker absorbs them.
#[async_trait]
pub trait PlateDetector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(&self, frame: &GrayImage) -> Result<Vec<PlateBox>, DetectorError>;
}

/// Geometric sanity check applied to detector output before tracking
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateFilter {
    /// Minimum box area in pixels (exclusive)
    pub min_area: u64,

    /// Accepted width/height window (exclusive on both ends)
    pub min_aspect: f32,
    pub max_aspect: f32,
}

impl Default for PlateFilter {
    fn default() -> Self {
        Self {
            min_area: 500,
            min_aspect: 1.5,
            max_aspect: 6.0,
        }
    }
}

impl PlateFilter {
    pub fn accepts(&self, bbox: &PlateBox) -> bool {
        let aspect = bbox.aspect_ratio();
        bbox.area() > self.min_area && aspect > self.min_aspect && aspect < self.max_aspect
    }

    pub fn apply(&self, boxes: Vec<PlateBox>) -> Vec<PlateBox> {
        boxes.into_iter().filter(|b| self.accepts(b)).collect()
    }
}
