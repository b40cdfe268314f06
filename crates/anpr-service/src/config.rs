use crate::detector::PlateFilter;
use crate::dispatcher::DispatcherConfig;
use crate::ocr::remote_vision::RemoteVisionConfig;
use crate::tracker::TrackerConfig;
use anyhow::{bail, Context, Result};
use common::plates::CameraSpec;
use reqwest::Url;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_REMOTE_OCR_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_REMOTE_OCR_MODEL: &str = "google/gemini-2.0-flash-exp:free";

#[derive(Debug, Clone)]
pub struct AnprConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: String,

    /// Node ID reported by readiness and logs
    pub node_id: String,

    pub tracker: TrackerConfig,
    pub filter: PlateFilter,
    pub dispatcher: DispatcherConfig,

    /// Shortest plate text the remote OCR engine accepts
    pub min_plate_text_length: usize,

    /// Character confidence below which ONNX OCR output is discarded
    pub ocr_min_confidence: f32,

    pub detector_model: String,
    pub ocr_model: String,

    /// Directory saved plate images are written to
    pub save_dir: PathBuf,

    /// JSON-lines detection log, used when no record service is configured
    pub detection_log_path: PathBuf,

    /// Record keeping service detection records are POSTed to
    pub record_service_url: Option<Url>,

    /// Finalizing OCR engine, enabled by `REMOTE_OCR_API_KEY`
    pub remote_ocr: Option<RemoteVisionConfig>,

    pub remote_frame_timeout: Duration,
    pub camera_stop_timeout: Duration,

    /// Cameras started at boot
    pub cameras: Vec<CameraSpec>,
}

impl AnprConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = var("ANPR_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let node_id = var("NODE_ID").unwrap_or_else(|| {
            format!(
                "anpr-{}",
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "local".to_string())
            )
        });

        let min_plate_text_length = parse(&var, "MIN_PLATE_TEXT_LENGTH", 3)?;

        let tracker = TrackerConfig {
            iou_threshold: parse(&var, "IOU_THRESHOLD_FOR_MATCH", 0.3)?,
            min_score_to_buffer: parse(&var, "MIN_OCR_SCORE_TO_BUFFER", 35)?,
            stabilization: seconds(&var, "PLATE_SAVE_STABILIZATION_SECONDS", 0.75)?,
            candidate_timeout: seconds(&var, "PLATE_CANDIDATE_TIMEOUT_SECONDS", 3.0)?,
            ocr_frame_interval: parse(&var, "OCR_FRAME_INTERVAL", 1)?,
            min_text_length: min_plate_text_length,
        };
        if tracker.ocr_frame_interval == 0 {
            bail!("OCR_FRAME_INTERVAL must be at least 1");
        }
        if !(0.0..=1.0).contains(&tracker.iou_threshold) {
            bail!("IOU_THRESHOLD_FOR_MATCH must be within 0.0..=1.0");
        }

        let filter = PlateFilter {
            min_area: parse(&var, "MIN_PLATE_AREA", 500)?,
            min_aspect: parse(&var, "PLATE_ASPECT_MIN", 1.5)?,
            max_aspect: parse(&var, "PLATE_ASPECT_MAX", 6.0)?,
        };
        if filter.min_aspect >= filter.max_aspect {
            bail!("PLATE_ASPECT_MIN must be below PLATE_ASPECT_MAX");
        }

        let dispatcher = DispatcherConfig {
            max_concurrent_saves: parse(&var, "MAX_CONCURRENT_SAVES", 4)?,
            ..DispatcherConfig::default()
        };
        if dispatcher.max_concurrent_saves == 0 {
            bail!("MAX_CONCURRENT_SAVES must be at least 1");
        }

        let save_dir = PathBuf::from(var("SAVE_DIR").unwrap_or_else(|| "IMAGES_DETECTED".to_string()));
        let detection_log_path = var("DETECTION_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| save_dir.join("detections.jsonl"));

        let record_service_url = var("RECORD_SERVICE_URL")
            .map(|s| Url::parse(&s).context("Invalid RECORD_SERVICE_URL"))
            .transpose()?;

        let remote_ocr = match var("REMOTE_OCR_API_KEY") {
            Some(api_key) => {
                let api_url =
                    var("REMOTE_OCR_URL").unwrap_or_else(|| DEFAULT_REMOTE_OCR_URL.to_string());
                Url::parse(&api_url).context("Invalid REMOTE_OCR_URL")?;
                let model =
                    var("REMOTE_OCR_MODEL").unwrap_or_else(|| DEFAULT_REMOTE_OCR_MODEL.to_string());
                let mut remote = RemoteVisionConfig::new(api_url, api_key, model);
                remote.min_text_length = min_plate_text_length;
                remote.confidence = dispatcher.finalizing_confidence;
                Some(remote)
            }
            None => None,
        };

        let cameras = var("ANPR_CAMERAS")
            .map(|raw| {
                serde_json::from_str::<Vec<CameraSpec>>(&raw).context("Invalid ANPR_CAMERAS")
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            node_id,
            tracker,
            filter,
            dispatcher,
            min_plate_text_length,
            ocr_min_confidence: parse(&var, "OCR_MIN_CONFIDENCE", 0.3)?,
            detector_model: var("LPR_DETECTION_MODEL")
                .unwrap_or_else(|| "models/lpr_detector.onnx".to_string()),
            ocr_model: var("LPR_OCR_MODEL").unwrap_or_else(|| "models/lpr_ocr.onnx".to_string()),
            save_dir,
            detection_log_path,
            record_service_url,
            remote_ocr,
            remote_frame_timeout: seconds(&var, "REMOTE_FRAME_TIMEOUT_SECONDS", 5.0)?,
            camera_stop_timeout: seconds(&var, "CAMERA_STOP_TIMEOUT_SECONDS", 2.0)?,
            cameras,
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn seconds(var: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> Result<Duration> {
    let secs: f64 = parse(var, key, default)?;
    Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid {}: {}", key, secs))
}
