//! Save finalisation off the frame loop.
//!
//! Each [`SaveJob`] returned by the tracker runs as a tracked task: optional
//! second OCR pass, image storage, detection record, notification, then the
//! tracker's save ledger. The ledger is only updated once the record has
//! been written; a failed save releases its text so a later sighting of the
//! same plate can be saved.

use crate::notifier::Notifier;
use crate::ocr::OcrEngine;
use crate::records::{DetectionLog, RecordError, RecordId};
use crate::storage::{ImageStore, StorageError};
use crate::tracker::{SaveJob, Tracker};
use chrono::Utc;
use common::plates::{CameraSpec, DetectionRecord, PlateSavedEvent, PLATE_SAVED_EVENT};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::{ANPR_DISPATCH_LATENCY, ANPR_OCR_FAILURES, ANPR_OCR_LATENCY, ANPR_SAVES};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Saves finalised at the same time for one camera
    pub max_concurrent_saves: usize,

    /// Confidence recorded when the finalising OCR engine supplies the text
    pub finalizing_confidence: f32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_saves: 4,
            finalizing_confidence: 0.95,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("image storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("detection record failed: {0}")]
    Record(#[from] RecordError),
}

/// Collaborators a dispatcher hands saved plates to
#[derive(Clone)]
pub struct SaveSinks {
    pub store: Arc<dyn ImageStore>,
    pub log: Arc<dyn DetectionLog>,
    pub notifier: Arc<dyn Notifier>,
    /// Slower, more accurate engine consulted once per save
    pub final_ocr: Option<Arc<dyn OcrEngine>>,
}

/// What a completed save persisted
#[derive(Debug, Clone)]
pub struct SavedPlate {
    pub record_id: RecordId,
    pub record: DetectionRecord,
    pub plate_filename: String,
}

struct DispatcherInner {
    camera: CameraSpec,
    tracker: Tracker,
    sinks: SaveSinks,
    config: DispatcherConfig,
    permits: Semaphore,
}

#[derive(Clone)]
pub struct SaveDispatcher {
    inner: Arc<DispatcherInner>,
    tasks: TaskTracker,
}

impl SaveDispatcher {
    pub fn new(
        camera: CameraSpec,
        tracker: Tracker,
        sinks: SaveSinks,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent_saves.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                camera,
                tracker,
                sinks,
                config,
                permits,
            }),
            tasks: TaskTracker::new(),
        }
    }

    /// Finalise a save in the background
    pub fn dispatch(&self, job: SaveJob) {
        let inner = Arc::clone(&self.inner);
        self.tasks.spawn(async move {
            inner.run(job).await;
        });
    }

    /// Number of saves still being finalised
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for in-flight saves; returns false if `timeout` elapsed first
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let drained = tokio::time::timeout(timeout, self.tasks.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                camera_id = %self.inner.camera.id,
                pending = self.tasks.len(),
                "timed out waiting for in-flight saves"
            );
        }
        self.tasks.reopen();
        drained
    }

    /// Finalise a save on the current task
    pub async fn finalize(&self, job: &SaveJob) -> Result<SavedPlate, DispatchError> {
        self.inner.finalize(job).await
    }
}

impl DispatcherInner {
    async fn run(&self, job: SaveJob) {
        let camera_id = self.camera.id.as_str();
        let trigger = job.trigger.as_str();

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.tracker.abort_save(&job.text).await;
                return;
            }
        };

        let timer = ANPR_DISPATCH_LATENCY.start_timer();
        let result = self.finalize(&job).await;
        timer.observe_duration();

        match result {
            Ok(saved) => {
                ANPR_SAVES
                    .with_label_values(&[camera_id, trigger, "success"])
                    .inc();
                info!(
                    camera_id,
                    track_id = job.track_id,
                    text = %saved.record.text,
                    score = saved.record.score,
                    record_id = %saved.record_id,
                    file = %saved.plate_filename,
                    trigger,
                    "plate saved"
                );
            }
            Err(e) => {
                ANPR_SAVES
                    .with_label_values(&[camera_id, trigger, "failed"])
                    .inc();
                error!(
                    camera_id,
                    track_id = job.track_id,
                    text = %job.text,
                    error = %e,
                    "failed to save plate"
                );
                self.tracker.abort_save(&job.text).await;
            }
        }
    }

    /// Second OCR pass; falls back to the tracked read on failure or no text
    async fn final_reading(&self, job: &SaveJob) -> (String, f32) {
        let Some(engine) = self.sinks.final_ocr.as_ref() else {
            return (job.text.clone(), job.confidence);
        };

        let timer = ANPR_OCR_LATENCY
            .with_label_values(&[engine.name()])
            .start_timer();
        let result = engine.read(&job.plate_image).await;
        timer.observe_duration();

        match result {
            Ok(reading) if !reading.is_empty() => {
                if reading.text != job.text {
                    info!(
                        camera_id = %self.camera.id,
                        track_id = job.track_id,
                        tracked = %job.text,
                        finalized = %reading.text,
                        engine = engine.name(),
                        "finalizing OCR corrected plate text"
                    );
                }
                (reading.text, self.config.finalizing_confidence)
            }
            Ok(_) => (job.text.clone(), job.confidence),
            Err(e) => {
                ANPR_OCR_FAILURES
                    .with_label_values(&[engine.name()])
                    .inc();
                warn!(
                    camera_id = %self.camera.id,
                    track_id = job.track_id,
                    engine = engine.name(),
                    error = %e,
                    "finalizing OCR failed, keeping tracked text"
                );
                (job.text.clone(), job.confidence)
            }
        }
    }

    async fn finalize(&self, job: &SaveJob) -> Result<SavedPlate, DispatchError> {
        let (text, confidence) = self.final_reading(job).await;

        let sequence = self.tracker.save_count().await + 1;
        let images = self
            .sinks
            .store
            .save_images(
                &job.plate_image,
                job.full_frame.as_deref(),
                &text,
                sequence,
            )
            .await?;

        let record = DetectionRecord {
            timestamp: Utc::now(),
            text: text.clone(),
            confidence,
            score: job.score,
            plate_image_path: images.plate_path.clone(),
            full_frame_path: images.full_frame_path.clone(),
            camera_id: self.camera.id.clone(),
            location_id: self.camera.location_id,
            track_id: job.track_id,
        };
        let record_id = self.sinks.log.write_record(&record).await?;

        let event = PlateSavedEvent {
            filename: images.plate_filename.clone(),
            text: text.clone(),
            score: job.score,
            confidence,
            camera_id: self.camera.id.clone(),
            location_id: self.camera.location_id,
            track_id: job.track_id,
        };
        match serde_json::to_value(&event) {
            Ok(payload) => self.sinks.notifier.emit(PLATE_SAVED_EVENT, payload),
            Err(e) => warn!(error = %e, "failed to serialize plate event"),
        }

        self.tracker.complete_save(&job.text, &text).await;

        Ok(SavedPlate {
            record_id,
            record,
            plate_filename: images.plate_filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::BroadcastNotifier;
    use crate::ocr::{OcrError, OcrReading};
    use crate::scoring::HeuristicScorer;
    use crate::tracker::{SaveTrigger, TrackerConfig};
    use async_trait::async_trait;
    use common::plates::{CameraSource, PlateBox, SavedImages};
    use image::RgbImage;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Instant;

    struct FixedOcr(&'static str);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn read(&self, _plate: &RgbImage) -> Result<OcrReading, OcrError> {
            Ok(OcrReading::new(self.0, 0.8))
        }
    }

    struct FailingOcr;

    #[async_trait]
    impl OcrEngine for FailingOcr {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn read(&self, _plate: &RgbImage) -> Result<OcrReading, OcrError> {
            Err(OcrError::Inference("unavailable".into()))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<(String, u64, bool)>>,
    }

    #[async_trait]
    impl ImageStore for RecordingStore {
        async fn save_images(
            &self,
            _plate: &RgbImage,
            full_frame: Option<&RgbImage>,
            text: &str,
            sequence: u64,
        ) -> Result<SavedImages, StorageError> {
            self.saved
                .lock()
                .expect("lock")
                .push((text.to_string(), sequence, full_frame.is_some()));
            let filename = format!("plate_{}_{:04}.jpg", text, sequence);
            Ok(SavedImages {
                plate_path: PathBuf::from(&filename),
                plate_filename: filename,
                full_frame_filename: None,
                full_frame_path: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingLog {
        records: Mutex<Vec<DetectionRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl DetectionLog for RecordingLog {
        async fn write_record(&self, record: &DetectionRecord) -> Result<RecordId, RecordError> {
            if self.fail {
                return Err(RecordError::Rejected("database offline".into()));
            }
            let mut records = self.records.lock().expect("lock");
            records.push(record.clone());
            Ok(records.len().to_string())
        }
    }

    fn camera() -> CameraSpec {
        CameraSpec {
            id: "cam_1".to_string(),
            name: "North gate".to_string(),
            location_id: 4,
            source: CameraSource::Remote,
        }
    }

    fn job(text: &str) -> SaveJob {
        let now = Instant::now();
        SaveJob {
            track_id: 7,
            trigger: SaveTrigger::Stabilized,
            text: text.to_string(),
            score: 90,
            confidence: 0.7,
            plate_image: RgbImage::new(120, 30),
            full_frame: Some(Arc::new(RgbImage::new(640, 480))),
            first_seen_at: now,
            triggered_at: now,
        }
    }

    struct Fixture {
        dispatcher: SaveDispatcher,
        tracker: Tracker,
        store: Arc<RecordingStore>,
        log: Arc<RecordingLog>,
        notifier: BroadcastNotifier,
    }

    fn fixture(final_ocr: Option<Arc<dyn OcrEngine>>, failing_log: bool) -> Fixture {
        let tracker = Tracker::new(
            "cam_1",
            TrackerConfig::default(),
            Arc::new(FixedOcr("ABC1234")),
            Arc::new(HeuristicScorer),
        );
        let store = Arc::new(RecordingStore::default());
        let log = Arc::new(RecordingLog {
            fail: failing_log,
            ..RecordingLog::default()
        });
        let notifier = BroadcastNotifier::new(8);
        let dispatcher = SaveDispatcher::new(
            camera(),
            tracker.clone(),
            SaveSinks {
                store: store.clone(),
                log: log.clone(),
                notifier: Arc::new(notifier.clone()),
                final_ocr,
            },
            DispatcherConfig::default(),
        );
        Fixture {
            dispatcher,
            tracker,
            store,
            log,
            notifier,
        }
    }

    #[tokio::test]
    async fn test_finalize_persists_and_updates_ledger() {
        let f = fixture(None, false);
        let mut events = f.notifier.subscribe();

        let saved = f.dispatcher.finalize(&job("ABC1234")).await.expect("saved");
        assert_eq!(saved.record_id, "1");
        assert_eq!(saved.record.text, "ABC1234");
        assert_eq!(saved.record.confidence, 0.7);
        assert_eq!(saved.record.location_id, 4);
        assert_eq!(saved.record.camera_id, "cam_1");

        assert_eq!(
            f.store.saved.lock().expect("lock").clone(),
            vec![("ABC1234".to_string(), 1, true)]
        );
        assert_eq!(f.tracker.save_count().await, 1);
        assert_eq!(f.tracker.last_saved_text().await.as_deref(), Some("ABC1234"));

        let event = events.recv().await.expect("event");
        assert_eq!(event.event, PLATE_SAVED_EVENT);
        assert_eq!(event.payload["filename"], "plate_ABC1234_0001.jpg");
        assert_eq!(event.payload["track_id"], 7);
    }

    #[tokio::test]
    async fn test_finalizing_ocr_overrides_text() {
        let f = fixture(Some(Arc::new(FixedOcr("ABC1284"))), false);

        let saved = f.dispatcher.finalize(&job("ABC1234")).await.expect("saved");
        assert_eq!(saved.record.text, "ABC1284");
        assert_eq!(saved.record.confidence, 0.95);
        assert_eq!(f.tracker.last_saved_text().await.as_deref(), Some("ABC1284"));
    }

    #[tokio::test]
    async fn test_finalizing_ocr_failure_keeps_tracked_text() {
        let f = fixture(Some(Arc::new(FailingOcr)), false);

        let saved = f.dispatcher.finalize(&job("ABC1234")).await.expect("saved");
        assert_eq!(saved.record.text, "ABC1234");
        assert_eq!(saved.record.confidence, 0.7);
    }

    #[tokio::test]
    async fn test_record_failure_leaves_ledger_untouched() {
        let f = fixture(None, true);

        let result = f.dispatcher.finalize(&job("ABC1234")).await;
        assert!(matches!(result, Err(DispatchError::Record(_))));
        assert_eq!(f.tracker.save_count().await, 0);
        assert_eq!(f.tracker.last_saved_text().await, None);
        assert!(f.log.records.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_runs_in_background_and_drains() {
        let f = fixture(None, false);
        let t0 = Instant::now();
        let frame = Arc::new(RgbImage::new(640, 480));

        f.tracker
            .update(&[PlateBox::new(100, 100, 120, 30)], &frame, t0)
            .await;
        let jobs = f.tracker.tick(t0 + Duration::from_millis(750)).await;
        assert_eq!(jobs.len(), 1);

        for job in jobs {
            f.dispatcher.dispatch(job);
        }
        assert!(f.dispatcher.drain(Duration::from_secs(5)).await);
        assert_eq!(f.dispatcher.in_flight(), 0);
        assert_eq!(f.log.records.lock().expect("lock").len(), 1);
        assert_eq!(f.tracker.save_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_background_save_releases_text() {
        let f = fixture(None, true);
        let t0 = Instant::now();
        let frame = Arc::new(RgbImage::new(640, 480));

        f.tracker
            .update(&[PlateBox::new(100, 100, 120, 30)], &frame, t0)
            .await;
        let jobs = f.tracker.tick(t0 + Duration::from_millis(750)).await;
        for job in jobs {
            f.dispatcher.dispatch(job);
        }
        assert!(f.dispatcher.drain(Duration::from_secs(5)).await);

        // a new sighting of the same plate may be saved again
        f.tracker
            .update(&[PlateBox::new(400, 300, 120, 30)], &frame, t0 + Duration::from_secs(1))
            .await;
        let retry = f.tracker.tick(t0 + Duration::from_millis(1750)).await;
        assert_eq!(retry.len(), 1);
    }
}
