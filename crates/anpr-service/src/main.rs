use anpr_service::{
    api,
    camera::{CameraManager, ServiceComponents},
    config::AnprConfig,
    detector::onnx::{OnnxDetectorConfig, OnnxPlateDetector},
    dispatcher::SaveSinks,
    inference::OnnxRuntimeConfig,
    notifier::BroadcastNotifier,
    ocr::{
        onnx::{OnnxOcrConfig, OnnxOcrEngine},
        remote_vision::RemoteVisionOcr,
        OcrEngine,
    },
    records::{DetectionLog, HttpDetectionLog, JsonlDetectionLog},
    scoring::HeuristicScorer,
    storage::FsImageStore,
    AnprState,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so file logs are flushed on exit
    let _logging = telemetry::init_with_service("anpr-service");

    info!("Starting ANPR service...");

    let config = AnprConfig::from_env()?;
    info!(
        bind = %config.bind_addr,
        node_id = %config.node_id,
        save_dir = %config.save_dir.display(),
        "ANPR service configuration"
    );

    let runtime = OnnxRuntimeConfig::default().with_env_overrides();

    let detector = OnnxPlateDetector::load(OnnxDetectorConfig {
        model_path: config.detector_model.clone(),
        runtime: runtime.clone(),
        ..OnnxDetectorConfig::default()
    })
    .context("Failed to load plate detection model")?;

    let ocr = OnnxOcrEngine::load(OnnxOcrConfig {
        model_path: config.ocr_model.clone(),
        min_confidence: config.ocr_min_confidence,
        runtime,
        ..OnnxOcrConfig::default()
    })
    .context("Failed to load plate OCR model")?;

    let final_ocr = match config.remote_ocr.clone() {
        Some(remote) => {
            info!(model = %remote.model, "finalizing OCR enabled");
            let engine = RemoteVisionOcr::new(remote).context("Failed to create remote OCR client")?;
            Some(Arc::new(engine) as Arc<dyn OcrEngine>)
        }
        None => None,
    };

    let log: Arc<dyn DetectionLog> = match &config.record_service_url {
        Some(url) => {
            info!(url = %url, "detection records go to record service");
            Arc::new(HttpDetectionLog::new(url.as_str()).context("Failed to create record client")?)
        }
        None => {
            info!(path = %config.detection_log_path.display(), "detection records go to local log");
            Arc::new(JsonlDetectionLog::new(config.detection_log_path.clone()))
        }
    };

    let events = BroadcastNotifier::default();
    let cameras = CameraManager::new(ServiceComponents {
        detector: Arc::new(detector),
        ocr: Arc::new(ocr),
        scorer: Arc::new(HeuristicScorer),
        filter: config.filter,
        tracker: config.tracker.clone(),
        dispatcher: config.dispatcher.clone(),
        sinks: SaveSinks {
            store: Arc::new(FsImageStore::new(config.save_dir.clone())),
            log,
            notifier: Arc::new(events.clone()),
            final_ocr,
        },
        remote_frame_timeout: config.remote_frame_timeout,
        stop_timeout: config.camera_stop_timeout,
    });

    for spec in config.cameras.clone() {
        let camera_id = spec.id.clone();
        if let Err(e) = cameras.start(spec).await {
            warn!(camera_id = %camera_id, error = %e, "failed to start configured camera");
        }
    }

    let state = AnprState::new(config.node_id.clone(), cameras, events);
    let app = api::router(state.clone());

    info!("Binding to {}", config.bind_addr);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("ANPR service listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gracefully...");
    state.shutdown().await;
    info!("ANPR service stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
