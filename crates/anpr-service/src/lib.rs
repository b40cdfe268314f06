pub mod api;
pub mod camera;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod geometry;
pub mod inference;
pub mod notifier;
pub mod ocr;
pub mod records;
pub mod scoring;
pub mod state;
pub mod storage;
pub mod tracker;

pub use camera::{CameraManager, ServiceComponents};
pub use config::AnprConfig;
pub use state::AnprState;
pub use tracker::{Tracker, TrackerConfig};
