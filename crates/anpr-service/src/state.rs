use crate::camera::CameraManager;
use crate::notifier::BroadcastNotifier;
use std::sync::Arc;

/// Shared state behind the HTTP surface
#[derive(Clone)]
pub struct AnprState {
    inner: Arc<AnprStateInner>,
}

struct AnprStateInner {
    node_id: String,
    cameras: CameraManager,
    events: BroadcastNotifier,
}

impl AnprState {
    pub fn new(node_id: impl Into<String>, cameras: CameraManager, events: BroadcastNotifier) -> Self {
        Self {
            inner: Arc::new(AnprStateInner {
                node_id: node_id.into(),
                cameras,
                events,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn cameras(&self) -> &CameraManager {
        &self.inner.cameras
    }

    /// Source of the real-time event feed
    pub fn events(&self) -> &BroadcastNotifier {
        &self.inner.events
    }

    /// Stop every camera and wait for their pending saves
    pub async fn shutdown(&self) {
        self.inner.cameras.shutdown().await;
    }
}
