use common::plates::{CandidatePhase, CandidateStatus, PlateBox};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Save-readiness of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stabilization {
    /// Best read is not good enough yet, or the candidate was abandoned as a duplicate
    Unarmed,
    /// Persist once `deadline` passes without a better read
    Armed { deadline: Instant },
    /// Handed to the save dispatcher; never leaves this state
    Saved,
}

impl Stabilization {
    pub fn phase(&self) -> CandidatePhase {
        match self {
            Stabilization::Unarmed => CandidatePhase::Unarmed,
            Stabilization::Armed { .. } => CandidatePhase::Armed,
            Stabilization::Saved => CandidatePhase::Saved,
        }
    }
}

/// One plate sighting followed across frames
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: u64,
    pub bbox: PlateBox,
    pub best_text: String,
    pub best_score: u32,
    pub confidence: f32,
    /// Crop taken when `best_score` last improved (initially the first crop)
    pub best_plate: RgbImage,
    /// Frame the best crop was taken from
    pub best_frame: Arc<RgbImage>,
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
    pub last_updated_at: Instant,
    pub frames_seen: u64,
    pub state: Stabilization,
}

impl Candidate {
    pub fn new(
        id: u64,
        bbox: PlateBox,
        plate: RgbImage,
        frame: Arc<RgbImage>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            bbox,
            best_text: String::new(),
            best_score: 0,
            confidence: 0.0,
            best_plate: plate,
            best_frame: frame,
            first_seen_at: now,
            last_seen_at: now,
            last_updated_at: now,
            frames_seen: 1,
            state: Stabilization::Unarmed,
        }
    }

    /// Record a detector match for this frame
    pub fn observe(&mut self, bbox: PlateBox, now: Instant) {
        self.bbox = bbox;
        self.last_seen_at = now;
        self.frames_seen += 1;
    }

    /// Whether this match should be read, given an OCR interval of `interval` matches
    pub fn wants_ocr(&self, interval: u32) -> bool {
        (self.frames_seen - 1) % u64::from(interval.max(1)) == 0
    }

    /// Offer a new OCR read.
    ///
    /// Only a strictly higher score replaces the best read. An improvement
    /// above `arm_above` (re)starts the stabilization countdown unless the
    /// candidate is already saved. Returns whether the read was an improvement.
    #[allow(clippy::too_many_arguments)]
    pub fn offer(
        &mut self,
        text: String,
        confidence: f32,
        score: u32,
        plate: RgbImage,
        frame: Arc<RgbImage>,
        now: Instant,
        arm_above: u32,
        stabilization: Duration,
    ) -> bool {
        if score <= self.best_score {
            return false;
        }

        self.best_text = text;
        self.best_score = score;
        self.confidence = confidence;
        self.best_plate = plate;
        self.best_frame = frame;
        self.last_updated_at = now;

        if self.state != Stabilization::Saved && score > arm_above {
            self.state = Stabilization::Armed {
                deadline: now + stabilization,
            };
        }
        true
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, Stabilization::Armed { .. })
    }

    /// Armed and the quiet window has elapsed
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.state, Stabilization::Armed { deadline } if now >= deadline)
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen_at) > timeout
    }

    pub fn status(&self, now: Instant) -> CandidateStatus {
        CandidateStatus {
            id: self.id,
            bbox: self.bbox,
            best_text: self.best_text.clone(),
            best_score: self.best_score,
            confidence: self.confidence,
            phase: self.state.phase(),
            frames_seen: self.frames_seen,
            age_ms: now.saturating_duration_since(self.first_seen_at).as_millis() as u64,
            idle_ms: now.saturating_duration_since(self.last_seen_at).as_millis() as u64,
        }
    }
}
