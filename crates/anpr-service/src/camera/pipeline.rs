//! Per-camera frame loop: detect, filter, track, dispatch, annotate.
//!
//! Frames of one camera are processed strictly in arrival order on a single
//! task. Saves run on the dispatcher's own tasks and never block the loop.

use super::overlay;
use super::source::{FrameSource, SourceEvent};
use crate::detector::{PlateDetector, PlateFilter};
use crate::dispatcher::SaveDispatcher;
use crate::storage::encode_jpeg;
use crate::tracker::Tracker;
use common::plates::PlateBox;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use telemetry::metrics::{ANPR_DETECTIONS, ANPR_FRAMES_PROCESSED};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PREVIEW_JPEG_QUALITY: u8 = 80;

/// Counters and preview shared with the camera manager
#[derive(Debug)]
pub struct PipelineStats {
    frames_processed: AtomicU64,
    /// Unix timestamp in milliseconds
    started_at: u64,
    latest_preview: RwLock<Option<Arc<Vec<u8>>>>,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            latest_preview: RwLock::new(None),
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Latest annotated frame as JPEG
    pub async fn latest_preview(&self) -> Option<Arc<Vec<u8>>> {
        self.latest_preview.read().await.clone()
    }
}

pub struct CameraPipeline {
    camera_id: String,
    detector: Arc<dyn PlateDetector>,
    filter: PlateFilter,
    tracker: Tracker,
    dispatcher: SaveDispatcher,
    stats: Arc<PipelineStats>,
}

impl CameraPipeline {
    pub fn new(
        detector: Arc<dyn PlateDetector>,
        filter: PlateFilter,
        tracker: Tracker,
        dispatcher: SaveDispatcher,
    ) -> Self {
        Self {
            camera_id: tracker.camera_id().to_string(),
            detector,
            filter,
            tracker,
            dispatcher,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Detected and filtered plate boxes, `None` if the detector failed
    async fn detect(&self, frame: &RgbImage) -> Option<Vec<PlateBox>> {
        let gray = image::imageops::grayscale(frame);
        match self.detector.detect(&gray).await {
            Ok(boxes) => {
                let accepted = self.filter.apply(boxes);
                ANPR_DETECTIONS
                    .with_label_values(&[&self.camera_id])
                    .inc_by(accepted.len() as u64);
                Some(accepted)
            }
            Err(e) => {
                warn!(
                    camera_id = %self.camera_id,
                    detector = self.detector.name(),
                    error = %e,
                    "plate detection failed"
                );
                None
            }
        }
    }

    /// Run one frame through detection, tracking and dispatch.
    ///
    /// Returns the number of saves dispatched.
    pub async fn process_frame(&self, frame: RgbImage, now: Instant) -> usize {
        let detected = self.detect(&frame).await;
        let status = if detected.is_some() { "ok" } else { "detector_error" };
        // a failed detection still advances tracking as an empty frame
        let boxes = detected.unwrap_or_default();
        let frame = Arc::new(frame);

        let jobs = self.tracker.update(&boxes, &frame, now).await;
        let dispatched = jobs.len();
        for job in jobs {
            self.dispatcher.dispatch(job);
        }

        self.refresh_preview(&frame, now).await;
        self.stats.frames_processed.fetch_add(1, Ordering::Relaxed);
        ANPR_FRAMES_PROCESSED
            .with_label_values(&[&self.camera_id, status])
            .inc();

        dispatched
    }

    /// Let time pass without a frame so due and stale candidates are handled
    pub async fn process_idle(&self, now: Instant) -> usize {
        let jobs = self.tracker.tick(now).await;
        let dispatched = jobs.len();
        for job in jobs {
            self.dispatcher.dispatch(job);
        }
        dispatched
    }

    /// Settle armed candidates that are still inside their quiet period
    pub async fn flush(&self) -> usize {
        let horizon = Instant::now() + self.tracker.config().stabilization;
        self.process_idle(horizon).await
    }

    async fn refresh_preview(&self, frame: &RgbImage, now: Instant) {
        let candidates = self.tracker.candidates(now).await;
        let annotated = overlay::annotate(frame, &candidates);
        match encode_jpeg(&annotated, PREVIEW_JPEG_QUALITY) {
            Ok(jpeg) => *self.stats.latest_preview.write().await = Some(Arc::new(jpeg)),
            Err(e) => debug!(camera_id = %self.camera_id, error = %e, "failed to encode preview"),
        }
    }

    /// Consume frames until the source closes or `cancel` fires
    pub async fn run(self, mut source: Box<dyn FrameSource>, cancel: CancellationToken) {
        info!(camera_id = %self.camera_id, "camera pipeline started");

        loop {
            match source.next_frame(&cancel).await {
                SourceEvent::Frame(frame) => {
                    self.process_frame(frame, Instant::now()).await;
                }
                SourceEvent::Idle => {
                    self.process_idle(Instant::now()).await;
                }
                SourceEvent::Closed => break,
            }
        }

        let flushed = self.flush().await;
        if flushed > 0 {
            debug!(camera_id = %self.camera_id, flushed, "saved pending candidates on stop");
        }

        info!(
            camera_id = %self.camera_id,
            frames = self.stats.frames_processed(),
            cancelled = cancel.is_cancelled(),
            "camera pipeline stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::dispatcher::{DispatcherConfig, SaveSinks};
    use crate::notifier::LogNotifier;
    use crate::ocr::{OcrEngine, OcrError, OcrReading};
    use crate::records::JsonlDetectionLog;
    use crate::scoring::HeuristicScorer;
    use crate::storage::FsImageStore;
    use crate::camera::source::remote_channel;
    use crate::tracker::TrackerConfig;
    use async_trait::async_trait;
    use common::plates::{CameraSource, CameraSpec, CandidatePhase};
    use image::GrayImage;
    use std::time::Duration;

    struct FixedDetector(Vec<PlateBox>);

    #[async_trait]
    impl PlateDetector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn detect(&self, _frame: &GrayImage) -> Result<Vec<PlateBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    #[async_trait]
    impl PlateDetector for BrokenDetector {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn detect(&self, _frame: &GrayImage) -> Result<Vec<PlateBox>, DetectorError> {
            Err(DetectorError::Inference("cuda lost".into()))
        }
    }

    struct FixedOcr;

    #[async_trait]
    impl OcrEngine for FixedOcr {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn read(&self, _plate: &RgbImage) -> Result<OcrReading, OcrError> {
            Ok(OcrReading::new("KA01AB1234", 0.9))
        }
    }

    fn pipeline(
        detector: Arc<dyn PlateDetector>,
        dir: &std::path::Path,
    ) -> (CameraPipeline, SaveDispatcher) {
        let camera = CameraSpec {
            id: "cam_gate".to_string(),
            name: String::new(),
            location_id: 1,
            source: CameraSource::Remote,
        };
        let tracker = Tracker::new(
            "cam_gate",
            TrackerConfig::default(),
            Arc::new(FixedOcr),
            Arc::new(HeuristicScorer),
        );
        let dispatcher = SaveDispatcher::new(
            camera,
            tracker.clone(),
            SaveSinks {
                store: Arc::new(FsImageStore::new(dir)),
                log: Arc::new(JsonlDetectionLog::new(dir.join("detections.jsonl"))),
                notifier: Arc::new(LogNotifier),
                final_ocr: None,
            },
            DispatcherConfig::default(),
        );
        (
            CameraPipeline::new(detector, PlateFilter::default(), tracker, dispatcher.clone()),
            dispatcher,
        )
    }

    #[tokio::test]
    async fn test_frames_flow_into_a_single_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let detector = Arc::new(FixedDetector(vec![
            PlateBox::new(100, 100, 120, 30),
            // too small, filtered out
            PlateBox::new(300, 300, 20, 10),
        ]));
        let (pipeline, dispatcher) = pipeline(detector, dir.path());
        let t0 = Instant::now();

        for i in 0..5u64 {
            let frame = RgbImage::new(640, 480);
            pipeline
                .process_frame(frame, t0 + Duration::from_millis(100 * i))
                .await;
        }
        let candidates = pipeline.tracker.candidates(t0 + Duration::from_millis(400)).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].phase, CandidatePhase::Armed);

        let dispatched = pipeline.process_idle(t0 + Duration::from_millis(750)).await;
        assert_eq!(dispatched, 1);
        assert!(dispatcher.drain(Duration::from_secs(5)).await);

        let log = std::fs::read_to_string(dir.path().join("detections.jsonl")).expect("log");
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("KA01AB1234"));
        assert_eq!(pipeline.stats().frames_processed(), 5);
        assert!(pipeline.stats().latest_preview().await.is_some());
    }

    #[tokio::test]
    async fn test_flush_saves_armed_candidate_before_its_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let detector = Arc::new(FixedDetector(vec![PlateBox::new(100, 100, 120, 30)]));
        let (pipeline, dispatcher) = pipeline(detector, dir.path());

        pipeline
            .process_frame(RgbImage::new(640, 480), Instant::now())
            .await;
        assert_eq!(pipeline.process_idle(Instant::now()).await, 0);

        assert_eq!(pipeline.flush().await, 1);
        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        assert_eq!(pipeline.flush().await, 0);

        let log = std::fs::read_to_string(dir.path().join("detections.jsonl")).expect("log");
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("KA01AB1234"));
    }

    #[tokio::test]
    async fn test_detector_failure_is_an_empty_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, _dispatcher) = pipeline(Arc::new(BrokenDetector), dir.path());

        let dispatched = pipeline
            .process_frame(RgbImage::new(320, 240), Instant::now())
            .await;
        assert_eq!(dispatched, 0);
        assert_eq!(pipeline.tracker.active_count().await, 0);
        assert_eq!(pipeline.stats().frames_processed(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, _dispatcher) = pipeline(Arc::new(FixedDetector(Vec::new())), dir.path());
        let (sender, source) = remote_channel("cam_gate", Duration::from_millis(20));
        let cancel = CancellationToken::new();

        let stats = pipeline.stats();
        let handle = tokio::spawn(pipeline.run(Box::new(source), cancel.clone()));
        sender.push(RgbImage::new(64, 48));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("pipeline stops promptly")
            .expect("task completes");
        assert_eq!(stats.frames_processed(), 1);
    }
}
