//! Multi-frame plate candidate tracker.
//!
//! Turns per-frame detector boxes into one save decision per physical plate
//! sighting. Each camera owns one [`Tracker`]; clones share the same state.
//!
//! `update` runs in three phases so that OCR never runs under the lock:
//! match boxes and collect crops, read the crops, then apply the reads,
//! decide which candidates are ready to save and evict stale ones.

mod candidate;

pub use candidate::{Candidate, Stabilization};

use crate::geometry::iou;
use crate::ocr::{OcrEngine, OcrReading};
use crate::scoring::PlateScorer;
use common::plates::{CandidateStatus, PlateBox};
use image::RgbImage;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics::{
    ANPR_ACTIVE_TRACKS, ANPR_OCR_FAILURES, ANPR_OCR_LATENCY, ANPR_SAVES, ANPR_TRACKS_CREATED,
    ANPR_TRACKS_EVICTED,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// A box continues a candidate only when their IoU is strictly above this
    pub iou_threshold: f32,

    /// Best score must be strictly above this to arm a save
    pub min_score_to_buffer: u32,

    /// Quiet period without an improving read before an armed candidate is saved
    pub stabilization: Duration,

    /// Candidates unmatched for longer than this are evicted
    pub candidate_timeout: Duration,

    /// Read every Nth match of a candidate (1 = every frame)
    pub ocr_frame_interval: u32,

    /// Reads with fewer characters, ignoring spaces and dashes, score zero
    pub min_text_length: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            min_score_to_buffer: 35,
            stabilization: Duration::from_millis(750),
            candidate_timeout: Duration::from_secs(3),
            ocr_frame_interval: 1,
            min_text_length: 3,
        }
    }
}

/// Why a candidate was handed to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// The stabilization window elapsed
    Stabilized,
    /// The candidate timed out while armed
    Timeout,
}

impl SaveTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveTrigger::Stabilized => "stabilized",
            SaveTrigger::Timeout => "timeout",
        }
    }
}

/// Point-in-time copy of a candidate taken when it was marked saved
#[derive(Debug, Clone)]
pub struct SaveJob {
    pub track_id: u64,
    pub trigger: SaveTrigger,
    pub text: String,
    pub score: u32,
    pub confidence: f32,
    pub plate_image: RgbImage,
    pub full_frame: Option<Arc<RgbImage>>,
    pub first_seen_at: Instant,
    pub triggered_at: Instant,
}

/// Per-camera record of what has been persisted
#[derive(Debug, Default)]
struct SaveLedger {
    last_saved_text: Option<String>,
    save_count: u64,
    /// Texts handed to the dispatcher whose save has not completed yet
    in_flight: HashSet<String>,
}

impl SaveLedger {
    fn is_duplicate(&self, text: &str) -> bool {
        self.last_saved_text.as_deref() == Some(text) || self.in_flight.contains(text)
    }
}

#[derive(Default)]
struct TrackerState {
    /// Live candidates in creation order
    candidates: Vec<Candidate>,
    next_id: u64,
    ledger: SaveLedger,
}

struct TrackerInner {
    camera_id: String,
    config: TrackerConfig,
    ocr: Arc<dyn OcrEngine>,
    scorer: Arc<dyn PlateScorer>,
    state: Mutex<TrackerState>,
}

#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

/// Crop of one candidate waiting to be read outside the lock
struct OcrRequest {
    track_id: u64,
    plate: RgbImage,
    frame: Arc<RgbImage>,
}

struct OcrOutcome {
    request: OcrRequest,
    reading: OcrReading,
    score: u32,
}

/// Result of matching one frame's boxes against the live candidates
#[derive(Debug, Default, PartialEq)]
struct Assignment {
    /// (box index, candidate index)
    matched: Vec<(usize, usize)>,
    /// Boxes that overlap no live candidate, in detector order
    unmatched: Vec<usize>,
}

/// Greedy one-to-one matching.
///
/// All (box, candidate) pairs above the threshold are taken in order of
/// decreasing IoU, then increasing candidate id, then box index. A box whose
/// overlapping candidates were all claimed by better boxes is dropped rather
/// than starting a new candidate.
fn assign(candidates: &[Candidate], boxes: &[PlateBox], threshold: f32) -> Assignment {
    let mut pairs = Vec::new();
    let mut overlapping = vec![false; boxes.len()];
    for (b, bbox) in boxes.iter().enumerate() {
        for (c, candidate) in candidates.iter().enumerate() {
            let overlap = iou(bbox, &candidate.bbox);
            if overlap > threshold {
                pairs.push((overlap, candidate.id, b, c));
                overlapping[b] = true;
            }
        }
    }

    pairs.sort_by(|x, y| {
        y.0.partial_cmp(&x.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(x.1.cmp(&y.1))
            .then(x.2.cmp(&y.2))
    });

    let mut box_taken = vec![false; boxes.len()];
    let mut candidate_taken = vec![false; candidates.len()];
    let mut matched = Vec::new();
    for (_, _, b, c) in pairs {
        if box_taken[b] || candidate_taken[c] {
            continue;
        }
        box_taken[b] = true;
        candidate_taken[c] = true;
        matched.push((b, c));
    }

    let unmatched = (0..boxes.len()).filter(|b| !overlapping[*b]).collect();
    Assignment { matched, unmatched }
}

fn crop(frame: &RgbImage, bbox: &PlateBox) -> Option<RgbImage> {
    let clamped = bbox.clamp_to(frame.width(), frame.height())?;
    Some(
        image::imageops::crop_imm(
            frame,
            clamped.x,
            clamped.y,
            clamped.width,
            clamped.height,
        )
        .to_image(),
    )
}

impl Tracker {
    pub fn new(
        camera_id: impl Into<String>,
        config: TrackerConfig,
        ocr: Arc<dyn OcrEngine>,
        scorer: Arc<dyn PlateScorer>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                camera_id: camera_id.into(),
                config,
                ocr,
                scorer,
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.inner.camera_id
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Feed one frame's detections.
    ///
    /// Returns the candidates that became ready to persist during this
    /// update; each is already marked saved and must be handed to the
    /// dispatcher by the caller.
    pub async fn update(
        &self,
        boxes: &[PlateBox],
        frame: &Arc<RgbImage>,
        now: Instant,
    ) -> Vec<SaveJob> {
        let requests = self.match_boxes(boxes, frame, now).await;
        let outcomes = self.read_plates(requests).await;
        self.settle(outcomes, now).await
    }

    /// Advance time without a frame: save due candidates and evict stale ones
    pub async fn tick(&self, now: Instant) -> Vec<SaveJob> {
        self.settle(Vec::new(), now).await
    }

    async fn match_boxes(
        &self,
        boxes: &[PlateBox],
        frame: &Arc<RgbImage>,
        now: Instant,
    ) -> Vec<OcrRequest> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock().await;
        let existing = state.candidates.len();
        let assignment = assign(&state.candidates, boxes, config.iou_threshold);

        let mut requests = Vec::new();
        for (b, c) in assignment.matched {
            let candidate = &mut state.candidates[c];
            candidate.observe(boxes[b], now);
            if candidate.wants_ocr(config.ocr_frame_interval) {
                if let Some(plate) = crop(frame, &boxes[b]) {
                    requests.push(OcrRequest {
                        track_id: candidate.id,
                        plate,
                        frame: Arc::clone(frame),
                    });
                }
            }
        }

        for b in assignment.unmatched {
            let bbox = boxes[b];
            // two detections of one plate in the same frame start one candidate
            if state.candidates[existing..]
                .iter()
                .any(|c| iou(&bbox, &c.bbox) > config.iou_threshold)
            {
                continue;
            }
            let Some(plate) = crop(frame, &bbox) else {
                tracing::debug!(camera_id = %self.inner.camera_id, ?bbox, "box outside frame");
                continue;
            };

            state.next_id += 1;
            let id = state.next_id;
            requests.push(OcrRequest {
                track_id: id,
                plate: plate.clone(),
                frame: Arc::clone(frame),
            });
            state
                .candidates
                .push(Candidate::new(id, bbox, plate, Arc::clone(frame), now));
            ANPR_TRACKS_CREATED
                .with_label_values(&[&self.inner.camera_id])
                .inc();
            tracing::debug!(camera_id = %self.inner.camera_id, track_id = id, ?bbox, "new plate candidate");
        }

        requests
    }

    async fn read_plates(&self, requests: Vec<OcrRequest>) -> Vec<OcrOutcome> {
        let engine = self.inner.ocr.name();
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let timer = ANPR_OCR_LATENCY
                .with_label_values(&[engine])
                .start_timer();
            let reading = match self.inner.ocr.read(&request.plate).await {
                Ok(reading) => reading,
                Err(e) => {
                    ANPR_OCR_FAILURES.with_label_values(&[engine]).inc();
                    tracing::warn!(
                        camera_id = %self.inner.camera_id,
                        track_id = request.track_id,
                        engine,
                        error = %e,
                        "OCR failed, treating as empty read"
                    );
                    OcrReading::empty()
                }
            };
            timer.observe_duration();

            let score = if reading.is_empty()
                || plate_text_len(&reading.text) < self.inner.config.min_text_length
            {
                0
            } else {
                self.inner.scorer.score(&reading.text)
            };
            outcomes.push(OcrOutcome {
                request,
                reading,
                score,
            });
        }
        outcomes
    }

    async fn settle(&self, outcomes: Vec<OcrOutcome>, now: Instant) -> Vec<SaveJob> {
        let config = &self.inner.config;
        let camera_id = self.inner.camera_id.as_str();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        for outcome in outcomes {
            let Some(candidate) = state
                .candidates
                .iter_mut()
                .find(|c| c.id == outcome.request.track_id)
            else {
                continue;
            };
            let improved = candidate.offer(
                outcome.reading.text,
                outcome.reading.confidence,
                outcome.score,
                outcome.request.plate,
                outcome.request.frame,
                now,
                config.min_score_to_buffer,
                config.stabilization,
            );
            if improved {
                tracing::debug!(
                    camera_id,
                    track_id = candidate.id,
                    text = %candidate.best_text,
                    score = candidate.best_score,
                    armed = candidate.is_armed(),
                    "candidate improved"
                );
            }
        }

        let mut jobs = Vec::new();
        for candidate in state.candidates.iter_mut() {
            if candidate.is_due(now) {
                jobs.extend(self.trigger_save(
                    candidate,
                    &mut state.ledger,
                    SaveTrigger::Stabilized,
                    now,
                ));
            }
        }

        let mut evicted = 0u64;
        let mut kept = Vec::with_capacity(state.candidates.len());
        for mut candidate in state.candidates.drain(..) {
            if !candidate.is_stale(now, config.candidate_timeout) {
                kept.push(candidate);
                continue;
            }
            if candidate.is_armed() {
                jobs.extend(self.trigger_save(
                    &mut candidate,
                    &mut state.ledger,
                    SaveTrigger::Timeout,
                    now,
                ));
            }
            evicted += 1;
            tracing::debug!(
                camera_id,
                track_id = candidate.id,
                text = %candidate.best_text,
                saved = candidate.state == Stabilization::Saved,
                "evicted stale candidate"
            );
        }
        state.candidates = kept;

        if evicted > 0 {
            ANPR_TRACKS_EVICTED
                .with_label_values(&[camera_id])
                .inc_by(evicted);
        }
        ANPR_ACTIVE_TRACKS
            .with_label_values(&[camera_id])
            .set(state.candidates.len() as i64);

        jobs
    }

    /// Mark an armed candidate saved and snapshot it, or abandon it when
    /// its text is empty or already saved / being saved.
    fn trigger_save(
        &self,
        candidate: &mut Candidate,
        ledger: &mut SaveLedger,
        trigger: SaveTrigger,
        now: Instant,
    ) -> Option<SaveJob> {
        let camera_id = self.inner.camera_id.as_str();
        if candidate.best_text.is_empty() {
            candidate.state = Stabilization::Unarmed;
            return None;
        }
        if ledger.is_duplicate(&candidate.best_text) {
            candidate.state = Stabilization::Unarmed;
            ANPR_SAVES
                .with_label_values(&[camera_id, trigger.as_str(), "duplicate"])
                .inc();
            tracing::debug!(
                camera_id,
                track_id = candidate.id,
                text = %candidate.best_text,
                "duplicate of last saved plate, abandoning candidate"
            );
            return None;
        }

        candidate.state = Stabilization::Saved;
        ledger.in_flight.insert(candidate.best_text.clone());
        tracing::info!(
            camera_id,
            track_id = candidate.id,
            text = %candidate.best_text,
            score = candidate.best_score,
            trigger = trigger.as_str(),
            "plate stabilized, dispatching save"
        );

        Some(SaveJob {
            track_id: candidate.id,
            trigger,
            text: candidate.best_text.clone(),
            score: candidate.best_score,
            confidence: candidate.confidence,
            plate_image: candidate.best_plate.clone(),
            full_frame: Some(Arc::clone(&candidate.best_frame)),
            first_seen_at: candidate.first_seen_at,
            triggered_at: now,
        })
    }

    /// Record a persisted save.
    ///
    /// `job_text` is the text the job was dispatched with, `final_text` the
    /// text that was actually stored. Returns the new save count.
    pub async fn complete_save(&self, job_text: &str, final_text: &str) -> u64 {
        let mut state = self.inner.state.lock().await;
        state.ledger.in_flight.remove(job_text);
        state.ledger.last_saved_text = Some(final_text.to_string());
        state.ledger.save_count += 1;
        state.ledger.save_count
    }

    /// Forget a failed save so the same text can be saved again later
    pub async fn abort_save(&self, job_text: &str) {
        let mut state = self.inner.state.lock().await;
        state.ledger.in_flight.remove(job_text);
    }

    pub async fn save_count(&self) -> u64 {
        self.inner.state.lock().await.ledger.save_count
    }

    pub async fn last_saved_text(&self) -> Option<String> {
        self.inner.state.lock().await.ledger.last_saved_text.clone()
    }

    /// Snapshot of the live candidates, in creation order
    pub async fn candidates(&self, now: Instant) -> Vec<CandidateStatus> {
        let state = self.inner.state.lock().await;
        state.candidates.iter().map(|c| c.status(now)).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.candidates.len()
    }
}

/// Length of a plate read ignoring separators
fn plate_text_len(text: &str) -> usize {
    text.chars().filter(|c| *c != ' ' && *c != '-').count()
}
