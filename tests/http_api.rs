/// Integration tests for the ANPR HTTP API
use anpr_service::camera::{CameraManager, ServiceComponents};
use anpr_service::detector::{DetectorError, PlateDetector, PlateFilter};
use anpr_service::dispatcher::{DispatcherConfig, SaveSinks};
use anpr_service::notifier::BroadcastNotifier;
use anpr_service::ocr::{OcrEngine, OcrError, OcrReading};
use anpr_service::records::JsonlDetectionLog;
use anpr_service::scoring::HeuristicScorer;
use anpr_service::storage::{encode_jpeg, FsImageStore};
use anpr_service::tracker::TrackerConfig;
use anpr_service::{api, AnprState};
use async_trait::async_trait;
use axum_test::TestServer;
use base64::Engine;
use common::plates::{CameraStatus, PlateBox};
use image::{GrayImage, RgbImage};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Finds one plate in any frame large enough to hold it
struct OnePlate;

#[async_trait]
impl PlateDetector for OnePlate {
    fn name(&self) -> &'static str {
        "one_plate"
    }

    async fn detect(&self, frame: &GrayImage) -> Result<Vec<PlateBox>, DetectorError> {
        if frame.width() < 200 || frame.height() < 100 {
            return Ok(Vec::new());
        }
        Ok(vec![PlateBox::new(40, 40, 120, 30)])
    }
}

struct FixedOcr;

#[async_trait]
impl OcrEngine for FixedOcr {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn read(&self, _plate: &RgbImage) -> Result<OcrReading, OcrError> {
        Ok(OcrReading::new("CAB1234", 0.9))
    }
}

fn setup_test_service(dir: &Path) -> (TestServer, AnprState) {
    let events = BroadcastNotifier::default();
    let cameras = CameraManager::new(ServiceComponents {
        detector: Arc::new(OnePlate),
        ocr: Arc::new(FixedOcr),
        scorer: Arc::new(HeuristicScorer),
        filter: PlateFilter::default(),
        tracker: TrackerConfig::default(),
        dispatcher: DispatcherConfig::default(),
        sinks: SaveSinks {
            store: Arc::new(FsImageStore::new(dir)),
            log: Arc::new(JsonlDetectionLog::new(dir.join("detections.jsonl"))),
            notifier: Arc::new(events.clone()),
            final_ocr: None,
        },
        remote_frame_timeout: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
    });
    let state = AnprState::new("test-node", cameras, events);
    let server = TestServer::new(api::router(state.clone())).unwrap();
    (server, state)
}

fn remote_camera(id: &str) -> Value {
    json!({
        "id": id,
        "name": "Barrier 1",
        "location_id": 4,
        "source": { "type": "remote" }
    })
}

fn encoded_frame(width: u32, height: u32) -> String {
    let jpeg = encode_jpeg(&RgbImage::new(width, height), 90).unwrap();
    base64::engine::general_purpose::STANDARD.encode(jpeg)
}

#[tokio::test]
async fn test_health_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let (server, state) = setup_test_service(dir.path());

    let response = server.get("/healthz").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");

    let response = server.get("/readyz").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["node_id"], "test-node");

    server
        .post("/v1/cameras")
        .json(&remote_camera("cam_metrics"))
        .await;
    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), 200);
    assert!(response.text().contains("anpr_active_cameras"));

    state.shutdown().await;
}

#[tokio::test]
async fn test_camera_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (server, state) = setup_test_service(dir.path());

    let response = server.post("/v1/cameras").json(&remote_camera("cam_1")).await;
    assert_eq!(response.status_code(), 201);
    let status: CameraStatus = response.json();
    assert_eq!(status.spec.id, "cam_1");
    assert!(status.running);

    let response = server.post("/v1/cameras").json(&remote_camera("cam_1")).await;
    assert_eq!(response.status_code(), 409);

    let response = server.get("/v1/cameras").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["cameras"].as_array().map(Vec::len), Some(1));

    let response = server.get("/v1/cameras/cam_1").await;
    assert_eq!(response.status_code(), 200);

    let response = server.delete("/v1/cameras/cam_1").await;
    assert_eq!(response.status_code(), 200);

    let response = server.get("/v1/cameras/cam_1").await;
    assert_eq!(response.status_code(), 404);
    let response = server.delete("/v1/cameras/cam_1").await;
    assert_eq!(response.status_code(), 404);

    state.shutdown().await;
}

#[tokio::test]
async fn test_invalid_camera_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _state) = setup_test_service(dir.path());

    let response = server.post("/v1/cameras").json(&remote_camera("")).await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_pushed_frames_produce_candidates_and_preview() {
    let dir = tempfile::tempdir().unwrap();
    let (server, state) = setup_test_service(dir.path());

    server
        .post("/v1/cameras")
        .json(&remote_camera("cam_push"))
        .await;

    let response = server.get("/v1/cameras/cam_push/frame").await;
    assert_eq!(response.status_code(), 404);

    let response = server
        .post("/v1/cameras/cam_push/frames")
        .json(&json!({ "data": format!("data:image/jpeg;base64,{}", encoded_frame(320, 240)) }))
        .await;
    assert_eq!(response.status_code(), 202);
    let body: Value = response.json();
    assert_eq!(body["outcome"], "queued");

    let mut candidates = Vec::new();
    for _ in 0..50 {
        let body: Value = server.get("/v1/cameras/cam_push/candidates").await.json();
        candidates = body["candidates"].as_array().cloned().unwrap_or_default();
        if !candidates.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["best_text"], "CAB1234");
    let phase = candidates[0]["phase"].as_str().unwrap_or_default();
    assert!(phase == "armed" || phase == "saved", "unexpected phase {}", phase);

    let mut response = server.get("/v1/cameras/cam_push/frame").await;
    for _ in 0..50 {
        if response.status_code() == 200 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        response = server.get("/v1/cameras/cam_push/frame").await;
    }
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("content-type"), "image/jpeg");
    assert!(image::load_from_memory(response.as_bytes()).is_ok());

    state.shutdown().await;
}

#[tokio::test]
async fn test_bad_frames_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (server, state) = setup_test_service(dir.path());

    let response = server
        .post("/v1/cameras/missing/frames")
        .json(&json!({ "data": encoded_frame(32, 32) }))
        .await;
    assert_eq!(response.status_code(), 404);

    server
        .post("/v1/cameras")
        .json(&remote_camera("cam_bad"))
        .await;
    let response = server
        .post("/v1/cameras/cam_bad/frames")
        .json(&json!({ "data": "%%% not base64 %%%" }))
        .await;
    assert_eq!(response.status_code(), 400);

    state.shutdown().await;
}
