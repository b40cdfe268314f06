//! Frame sources feeding a camera pipeline.
//!
//! A source never blocks indefinitely: every wait is bounded and races the
//! camera's cancellation token, so stopping a camera is always prompt.

use super::CameraError;
use async_trait::async_trait;
use base64::Engine;
use image::RgbImage;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use telemetry::metrics::ANPR_REMOTE_FRAMES_DROPPED;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Pushed frames waiting for the pipeline
const REMOTE_QUEUE_CAPACITY: usize = 2;

/// Consecutive extraction failures before a polled source gives up
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug)]
pub enum SourceEvent {
    Frame(RgbImage),
    /// No frame arrived within the wait bound
    Idle,
    /// The source is finished or the camera was stopped
    Closed,
}

#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self, cancel: &CancellationToken) -> SourceEvent;
}

/// Decode a pushed frame given as base64 or as a `data:` URL
pub fn decode_remote_frame(data: &str) -> Result<RgbImage, CameraError> {
    let encoded = match data.split_once(',') {
        Some((header, body)) if header.starts_with("data:") => body,
        _ => data,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| CameraError::InvalidFrame(format!("bad base64: {}", e)))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| CameraError::InvalidFrame(format!("undecodable image: {}", e)))?;
    Ok(image.to_rgb8())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the pushed frame was discarded
    Dropped,
    /// The camera is no longer consuming frames
    Closed,
}

/// Producer half of a remote camera, held by the HTTP layer
#[derive(Debug, Clone)]
pub struct RemoteFrameSender {
    camera_id: String,
    tx: mpsc::Sender<RgbImage>,
}

impl RemoteFrameSender {
    pub fn push(&self, frame: RgbImage) -> PushOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                ANPR_REMOTE_FRAMES_DROPPED
                    .with_label_values(&[&self.camera_id])
                    .inc();
                debug!(camera_id = %self.camera_id, "frame queue full, dropping pushed frame");
                PushOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }
}

/// Frames pushed by a remote client
pub struct RemoteFrameSource {
    rx: mpsc::Receiver<RgbImage>,
    wait: Duration,
}

/// Create the two halves of a remote camera feed
pub fn remote_channel(
    camera_id: impl Into<String>,
    wait: Duration,
) -> (RemoteFrameSender, RemoteFrameSource) {
    let (tx, rx) = mpsc::channel(REMOTE_QUEUE_CAPACITY);
    (
        RemoteFrameSender {
            camera_id: camera_id.into(),
            tx,
        },
        RemoteFrameSource { rx, wait },
    )
}

#[async_trait]
impl FrameSource for RemoteFrameSource {
    async fn next_frame(&mut self, cancel: &CancellationToken) -> SourceEvent {
        tokio::select! {
            _ = cancel.cancelled() => SourceEvent::Closed,
            received = time::timeout(self.wait, self.rx.recv()) => match received {
                Ok(Some(frame)) => SourceEvent::Frame(frame),
                Ok(None) => SourceEvent::Closed,
                Err(_) => SourceEvent::Idle,
            },
        }
    }
}

/// Pulls single frames from a URI with ffmpeg at a fixed interval
pub struct PolledFrameSource {
    camera_id: String,
    uri: String,
    interval: Interval,
    failures: u32,
}

impl PolledFrameSource {
    pub fn new(camera_id: impl Into<String>, uri: impl Into<String>, every: Duration) -> Self {
        let mut interval = time::interval(every.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            camera_id: camera_id.into(),
            uri: uri.into(),
            interval,
            failures: 0,
        }
    }

    fn ffmpeg_args(uri: &str) -> Vec<String> {
        let mut args = vec!["-loglevel".to_string(), "error".to_string()];
        if uri.starts_with("rtsp://") {
            args.push("-rtsp_transport".to_string());
            args.push("tcp".to_string());
        }
        args.extend(
            [
                "-i", uri, "-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "2",
                "pipe:1",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    }

    async fn extract(&self) -> Result<RgbImage, CameraError> {
        let output = Command::new("ffmpeg")
            .args(Self::ffmpeg_args(&self.uri))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CameraError::Source(format!("failed to execute ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CameraError::Source(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(CameraError::Source("ffmpeg returned no frame data".to_string()));
        }

        let image = image::load_from_memory(&output.stdout)
            .map_err(|e| CameraError::InvalidFrame(e.to_string()))?;
        Ok(image.to_rgb8())
    }
}

#[async_trait]
impl FrameSource for PolledFrameSource {
    async fn next_frame(&mut self, cancel: &CancellationToken) -> SourceEvent {
        tokio::select! {
            _ = cancel.cancelled() => return SourceEvent::Closed,
            _ = self.interval.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return SourceEvent::Closed,
            result = self.extract() => result,
        };

        match result {
            Ok(frame) => {
                self.failures = 0;
                SourceEvent::Frame(frame)
            }
            Err(e) => {
                self.failures += 1;
                if self.failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(
                        camera_id = %self.camera_id,
                        uri = %self.uri,
                        failures = self.failures,
                        error = %e,
                        "giving up on frame source"
                    );
                    SourceEvent::Closed
                } else {
                    warn!(
                        camera_id = %self.camera_id,
                        uri = %self.uri,
                        failures = self.failures,
                        error = %e,
                        "frame extraction failed"
                    );
                    SourceEvent::Idle
                }
            }
        }
    }
}
