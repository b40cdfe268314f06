use super::pipeline::{CameraPipeline, PipelineStats};
use super::source::{
    remote_channel, FrameSource, PolledFrameSource, PushOutcome, RemoteFrameSender,
};
use super::CameraError;
use crate::detector::{PlateDetector, PlateFilter};
use crate::dispatcher::{DispatcherConfig, SaveDispatcher, SaveSinks};
use crate::ocr::OcrEngine;
use crate::scoring::PlateScorer;
use crate::tracker::{Tracker, TrackerConfig};
use common::plates::{CameraSource, CameraSpec, CameraStatus, CandidateStatus};
use image::RgbImage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics::{ANPR_ACTIVE_CAMERAS, ANPR_ACTIVE_TRACKS};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared collaborators and settings every camera is built from
#[derive(Clone)]
pub struct ServiceComponents {
    pub detector: Arc<dyn PlateDetector>,
    pub ocr: Arc<dyn OcrEngine>,
    pub scorer: Arc<dyn PlateScorer>,
    pub filter: PlateFilter,
    pub tracker: TrackerConfig,
    pub dispatcher: DispatcherConfig,
    pub sinks: SaveSinks,
    /// Longest wait for a pushed frame before the pipeline ticks idle
    pub remote_frame_timeout: Duration,
    /// Bound on joining a stopped camera and on draining its saves
    pub stop_timeout: Duration,
}

struct CameraWorker {
    spec: CameraSpec,
    tracker: Tracker,
    dispatcher: SaveDispatcher,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    remote: Option<RemoteFrameSender>,
}

impl CameraWorker {
    async fn status(&self) -> CameraStatus {
        CameraStatus {
            spec: self.spec.clone(),
            running: !self.handle.is_finished(),
            started_at: Some(self.stats.started_at()),
            frames_processed: self.stats.frames_processed(),
            active_candidates: self.tracker.active_count().await,
            saves: self.tracker.save_count().await,
            last_saved_text: self.tracker.last_saved_text().await,
        }
    }
}

struct ManagerInner {
    components: ServiceComponents,
    workers: RwLock<HashMap<String, CameraWorker>>,
}

/// Owns one pipeline task per running camera
#[derive(Clone)]
pub struct CameraManager {
    inner: Arc<ManagerInner>,
}

fn validate(spec: &CameraSpec) -> Result<(), CameraError> {
    if spec.id.trim().is_empty() {
        return Err(CameraError::InvalidSpec("camera id must not be empty".to_string()));
    }
    if let CameraSource::Uri { uri, .. } = &spec.source {
        if uri.trim().is_empty() {
            return Err(CameraError::InvalidSpec(format!(
                "camera '{}' has an empty source uri",
                spec.id
            )));
        }
    }
    Ok(())
}

impl CameraManager {
    pub fn new(components: ServiceComponents) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                components,
                workers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Start processing a camera
    pub async fn start(&self, spec: CameraSpec) -> Result<CameraStatus, CameraError> {
        validate(&spec)?;

        let mut workers = self.inner.workers.write().await;
        if let Some(existing) = workers.get(&spec.id) {
            if !existing.handle.is_finished() {
                return Err(CameraError::AlreadyRunning(spec.id));
            }
            // the previous pipeline ended on its own; replace it
            if let Some(stale) = workers.remove(&spec.id) {
                ANPR_ACTIVE_CAMERAS.dec();
                stale.cancel.cancel();
            }
        }

        let c = &self.inner.components;
        let tracker = Tracker::new(
            spec.id.clone(),
            c.tracker.clone(),
            Arc::clone(&c.ocr),
            Arc::clone(&c.scorer),
        );
        let dispatcher = SaveDispatcher::new(
            spec.clone(),
            tracker.clone(),
            c.sinks.clone(),
            c.dispatcher.clone(),
        );
        let pipeline = CameraPipeline::new(
            Arc::clone(&c.detector),
            c.filter.clone(),
            tracker.clone(),
            dispatcher.clone(),
        );
        let stats = pipeline.stats();

        let (source, remote): (Box<dyn FrameSource>, Option<RemoteFrameSender>) =
            match &spec.source {
                CameraSource::Remote => {
                    let (sender, source) =
                        remote_channel(spec.id.clone(), c.remote_frame_timeout);
                    (Box::new(source) as Box<dyn FrameSource>, Some(sender))
                }
                CameraSource::Uri {
                    uri,
                    poll_interval_ms,
                } => {
                    let source = PolledFrameSource::new(
                        spec.id.clone(),
                        uri.clone(),
                        Duration::from_millis(*poll_interval_ms),
                    );
                    (Box::new(source) as Box<dyn FrameSource>, None)
                }
            };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pipeline.run(source, cancel.clone()));

        let worker = CameraWorker {
            spec: spec.clone(),
            tracker,
            dispatcher,
            stats,
            cancel,
            handle,
            remote,
        };
        let status = worker.status().await;
        workers.insert(spec.id.clone(), worker);
        ANPR_ACTIVE_CAMERAS.inc();

        info!(
            camera_id = %spec.id,
            location_id = spec.location_id,
            source = ?spec.source,
            "camera started"
        );
        Ok(status)
    }

    /// Stop a camera, waiting boundedly for its loop and in-flight saves
    pub async fn stop(&self, camera_id: &str) -> Result<(), CameraError> {
        let worker = self
            .inner
            .workers
            .write()
            .await
            .remove(camera_id)
            .ok_or_else(|| CameraError::NotFound(camera_id.to_string()))?;
        ANPR_ACTIVE_CAMERAS.dec();

        let timeout = self.inner.components.stop_timeout;
        worker.cancel.cancel();
        let abort = worker.handle.abort_handle();
        match tokio::time::timeout(timeout, worker.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(camera_id, error = %e, "camera pipeline task failed"),
            Err(_) => {
                warn!(camera_id, ?timeout, "camera pipeline did not stop in time, aborting");
                abort.abort();
            }
        }

        worker.dispatcher.drain(timeout).await;
        let _ = ANPR_ACTIVE_TRACKS.remove_label_values(&[camera_id]);

        let saves = worker.tracker.save_count().await;
        info!(camera_id, saves, "camera stopped");
        Ok(())
    }

    pub async fn status(&self, camera_id: &str) -> Result<CameraStatus, CameraError> {
        let workers = self.inner.workers.read().await;
        let worker = workers
            .get(camera_id)
            .ok_or_else(|| CameraError::NotFound(camera_id.to_string()))?;
        Ok(worker.status().await)
    }

    /// Status of every camera, ordered by id
    pub async fn list(&self) -> Vec<CameraStatus> {
        let workers = self.inner.workers.read().await;
        let mut statuses = Vec::with_capacity(workers.len());
        for worker in workers.values() {
            statuses.push(worker.status().await);
        }
        statuses.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        statuses
    }

    pub async fn candidates(&self, camera_id: &str) -> Result<Vec<CandidateStatus>, CameraError> {
        let tracker = {
            let workers = self.inner.workers.read().await;
            workers
                .get(camera_id)
                .map(|w| w.tracker.clone())
                .ok_or_else(|| CameraError::NotFound(camera_id.to_string()))?
        };
        Ok(tracker.candidates(Instant::now()).await)
    }

    /// Latest annotated frame of a camera as JPEG
    pub async fn latest_frame(
        &self,
        camera_id: &str,
    ) -> Result<Option<Arc<Vec<u8>>>, CameraError> {
        let stats = {
            let workers = self.inner.workers.read().await;
            workers
                .get(camera_id)
                .map(|w| Arc::clone(&w.stats))
                .ok_or_else(|| CameraError::NotFound(camera_id.to_string()))?
        };
        Ok(stats.latest_preview().await)
    }

    /// Queue a frame for a remote camera
    pub async fn push_frame(
        &self,
        camera_id: &str,
        frame: RgbImage,
    ) -> Result<PushOutcome, CameraError> {
        let workers = self.inner.workers.read().await;
        let worker = workers
            .get(camera_id)
            .ok_or_else(|| CameraError::NotFound(camera_id.to_string()))?;
        let sender = worker
            .remote
            .as_ref()
            .ok_or_else(|| CameraError::NotRemote(camera_id.to_string()))?;
        Ok(sender.push(frame))
    }

    /// Stop every camera
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.workers.read().await.keys().cloned().collect();
        info!(cameras = ids.len(), "stopping all cameras");
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(camera_id = %id, error = %e, "failed to stop camera");
            }
        }
    }
}
