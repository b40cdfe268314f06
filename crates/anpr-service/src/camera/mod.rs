//! Camera ingestion and per-camera frame processing

pub mod manager;
pub mod overlay;
pub mod pipeline;
pub mod source;

pub use manager::{CameraManager, ServiceComponents};
pub use pipeline::CameraPipeline;
pub use source::{
    decode_remote_frame, FrameSource, PolledFrameSource, PushOutcome, RemoteFrameSender,
    RemoteFrameSource, SourceEvent,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera '{0}' is already running")]
    AlreadyRunning(String),

    #[error("camera '{0}' not found")]
    NotFound(String),

    #[error("camera '{0}' does not accept pushed frames")]
    NotRemote(String),

    #[error("invalid camera spec: {0}")]
    InvalidSpec(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("frame source failed: {0}")]
    Source(String),
}
