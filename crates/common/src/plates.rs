//! Plate recognition contracts for the ANPR engine.
//!
//! This module defines the geometry, camera and detection-record types shared
//! between the tracking engine, its HTTP surface and the external record keepers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the notification emitted after a plate has been persisted
pub const PLATE_SAVED_EVENT: &str = "new_plate_saved";

/// Axis-aligned plate region (x, y, width, height) in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlateBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PlateBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width over height, 0.0 for a box without height
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// Clamp the box to a frame of the given size.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<PlateBox> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(PlateBox::new(self.x, self.y, width, height))
    }
}

/// Where a camera's frames come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CameraSource {
    /// Frames are pushed by a remote client over HTTP
    Remote,

    /// Frames are pulled from a URI (RTSP, HLS, file, capture device)
    Uri {
        uri: String,

        /// Interval between two pulled frames in milliseconds
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    200
}

/// Camera definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSpec {
    /// Unique camera identifier (e.g., "cam_3")
    pub id: String,

    /// Human-readable camera or gate name
    #[serde(default)]
    pub name: String,

    /// Location the camera is installed at
    pub location_id: u64,

    pub source: CameraSource,
}

/// Paths produced by the image store for one saved plate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedImages {
    pub plate_filename: String,
    pub plate_path: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_frame_filename: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_frame_path: Option<PathBuf>,
}

/// Detection log entry handed to the record keeper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub timestamp: DateTime<Utc>,
    pub text: String,

    /// OCR confidence (0.0 to 1.0)
    pub confidence: f32,

    /// Plate text quality score
    pub score: u32,

    pub plate_image_path: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_frame_path: Option<PathBuf>,

    pub camera_id: String,
    pub location_id: u64,
    pub track_id: u64,
}

/// Payload of the [`PLATE_SAVED_EVENT`] notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateSavedEvent {
    pub filename: String,
    pub text: String,
    pub score: u32,
    pub confidence: f32,
    pub camera_id: String,
    pub location_id: u64,
    pub track_id: u64,
}

/// Save-readiness phase of a tracked plate candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePhase {
    /// Not yet read well enough to be persisted
    Unarmed,

    /// Waiting for a quiet stabilization window to elapse
    Armed,

    /// Handed over for persistence (terminal)
    Saved,
}

/// Point-in-time view of one live plate candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateStatus {
    pub id: u64,
    pub bbox: PlateBox,
    pub best_text: String,
    pub best_score: u32,
    pub confidence: f32,
    pub phase: CandidatePhase,
    pub frames_seen: u64,

    /// Milliseconds since the candidate was first detected
    pub age_ms: u64,

    /// Milliseconds since the candidate was last matched
    pub idle_ms: u64,
}

/// Camera state reported by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatus {
    pub spec: CameraSpec,
    pub running: bool,

    /// Timestamp when the camera started (Unix timestamp in milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,

    pub frames_processed: u64,
    pub active_candidates: usize,
    pub saves: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_saved_text: Option<String>,
}

/// Frame pushed by a remote client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFrame {
    /// Encoded image, either plain base64 or a `data:image/...;base64,` URL
    pub data: String,

    /// Capture timestamp (Unix timestamp in milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}
