/// End-to-end tests: tracker, save dispatcher and the filesystem sinks
use anpr_service::dispatcher::{DispatcherConfig, SaveDispatcher, SaveSinks};
use anpr_service::notifier::BroadcastNotifier;
use anpr_service::ocr::{OcrEngine, OcrError, OcrReading};
use anpr_service::records::JsonlDetectionLog;
use anpr_service::scoring::HeuristicScorer;
use anpr_service::storage::FsImageStore;
use anpr_service::tracker::{SaveTrigger, Tracker, TrackerConfig};
use async_trait::async_trait;
use common::plates::{CameraSource, CameraSpec, PlateBox, PLATE_SAVED_EVENT};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Always reads the same plate
struct FixedOcr(&'static str);

#[async_trait]
impl OcrEngine for FixedOcr {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn read(&self, _plate: &RgbImage) -> Result<OcrReading, OcrError> {
        Ok(OcrReading::new(self.0, 0.88))
    }
}

struct Harness {
    tracker: Tracker,
    dispatcher: SaveDispatcher,
    events: BroadcastNotifier,
}

fn harness(dir: &Path, config: TrackerConfig, text: &'static str) -> Harness {
    let camera = CameraSpec {
        id: "cam_3".to_string(),
        name: "Main gate".to_string(),
        location_id: 12,
        source: CameraSource::Remote,
    };
    let tracker = Tracker::new(
        camera.id.clone(),
        config,
        Arc::new(FixedOcr(text)),
        Arc::new(HeuristicScorer),
    );
    let events = BroadcastNotifier::default();
    let dispatcher = SaveDispatcher::new(
        camera,
        tracker.clone(),
        SaveSinks {
            store: Arc::new(FsImageStore::new(dir)),
            log: Arc::new(JsonlDetectionLog::new(dir.join("detections.jsonl"))),
            notifier: Arc::new(events.clone()),
            final_ocr: None,
        },
        DispatcherConfig::default(),
    );
    Harness {
        tracker,
        dispatcher,
        events,
    }
}

fn saved_images(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".jpg"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_one_vehicle_one_save_and_repeat_plate_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), TrackerConfig::default(), "KA01AB1234");
    let mut events = h.events.subscribe();
    let frame = Arc::new(RgbImage::new(640, 480));
    let t0 = Instant::now();

    // the plate drifts a few pixels per frame while the car approaches
    for i in 0..5u32 {
        let bbox = PlateBox::new(100 + 4 * i, 200, 120, 30);
        let jobs = h
            .tracker
            .update(&[bbox], &frame, t0 + Duration::from_millis(100 * i as u64))
            .await;
        assert!(jobs.is_empty(), "saved before the stabilization window");
    }
    assert_eq!(h.tracker.active_count().await, 1);

    let jobs = h.tracker.tick(t0 + Duration::from_millis(800)).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, SaveTrigger::Stabilized);
    assert_eq!(jobs[0].text, "KA01AB1234");
    for job in jobs {
        h.dispatcher.dispatch(job);
    }
    assert!(h.dispatcher.drain(Duration::from_secs(5)).await);

    // a second vehicle carrying the same plate shows up elsewhere
    for i in 0..5u64 {
        let jobs = h
            .tracker
            .update(
                &[PlateBox::new(400, 50, 110, 28)],
                &frame,
                t0 + Duration::from_millis(1000 + 100 * i),
            )
            .await;
        assert!(jobs.is_empty());
    }
    assert!(h.tracker.tick(t0 + Duration::from_millis(2500)).await.is_empty());

    // everything goes stale and is evicted without another save
    assert!(h.tracker.tick(t0 + Duration::from_secs(6)).await.is_empty());
    assert_eq!(h.tracker.active_count().await, 0);
    assert_eq!(h.tracker.save_count().await, 1);
    assert_eq!(h.tracker.last_saved_text().await.as_deref(), Some("KA01AB1234"));

    let images = saved_images(dir.path());
    assert_eq!(images.len(), 2);
    assert!(images[0].starts_with("plate_KA01AB1234_"));
    assert!(images[0].ends_with("_0001.jpg"));
    assert!(images[1].ends_with("_0001_full.jpg"));

    let log = std::fs::read_to_string(dir.path().join("detections.jsonl")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["text"], "KA01AB1234");
    assert_eq!(record["camera_id"], "cam_3");
    assert_eq!(record["location_id"], 12);

    let event = events.recv().await.unwrap();
    assert_eq!(event.event, PLATE_SAVED_EVENT);
    assert_eq!(event.payload["text"], "KA01AB1234");
    assert_eq!(event.payload["filename"], images[0].as_str());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_armed_candidate_leaving_early_is_saved_on_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrackerConfig {
        stabilization: Duration::from_secs(10),
        candidate_timeout: Duration::from_secs(1),
        ..TrackerConfig::default()
    };
    let h = harness(dir.path(), config, "WP CAB 1234");
    let frame = Arc::new(RgbImage::new(640, 480));
    let t0 = Instant::now();

    h.tracker
        .update(&[PlateBox::new(50, 50, 150, 40)], &frame, t0)
        .await;

    // still within the timeout: nothing happens
    assert!(h.tracker.tick(t0 + Duration::from_millis(900)).await.is_empty());

    let jobs = h.tracker.tick(t0 + Duration::from_millis(1100)).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, SaveTrigger::Timeout);
    assert!(jobs[0].full_frame.is_some());

    let saved = h.dispatcher.finalize(&jobs[0]).await.unwrap();
    assert_eq!(saved.record.text, "WP CAB 1234");
    assert!(saved.plate_filename.starts_with("plate_WPCAB1234_"));
    assert_eq!(saved.record_id, "1");
    assert_eq!(h.tracker.active_count().await, 0);
    assert_eq!(h.tracker.save_count().await, 1);
}

#[tokio::test]
async fn test_unreadable_plate_is_never_saved() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), TrackerConfig::default(), "");
    let frame = Arc::new(RgbImage::new(640, 480));
    let t0 = Instant::now();

    for i in 0..10u64 {
        let jobs = h
            .tracker
            .update(
                &[PlateBox::new(10, 10, 100, 25)],
                &frame,
                t0 + Duration::from_millis(100 * i),
            )
            .await;
        assert!(jobs.is_empty());
    }
    assert!(h.tracker.tick(t0 + Duration::from_secs(10)).await.is_empty());
    assert_eq!(h.tracker.save_count().await, 0);
    assert!(saved_images(dir.path()).is_empty());
}
