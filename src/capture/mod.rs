//! Capture boundary for the Focus Sensor Agent.
//!
//! The camera and the landmark detector live outside this crate. A
//! [`SampleSource`] stands in for that stage: each call yields the features of
//! one frame (or a failed acquisition), honouring the current QoS settings.

pub mod noop;
pub mod replay;
pub mod types;

use crate::core::qos::QosSettings;
use thiserror::Error;

pub use noop::NoopSource;
pub use replay::JsonLinesSource;
pub use types::{Acquisition, Clock, FeatureSample};

/// The external capture + feature extraction stage.
pub trait SampleSource: Send {
    /// Grab one frame and return its features.
    ///
    /// May block for up to roughly one frame budget.
    fn next_sample(&mut self, settings: &QosSettings) -> Acquisition;

    /// Switch the active device.
    fn switch_camera(&mut self, index: u32) -> Result<(), CaptureError>;

    /// Index of the active device.
    fn current_camera(&self) -> u32;
}

/// Enumerates devices without touching the active one.
pub trait CameraProbe: Send + Sync {
    /// Indices that can currently be opened.
    fn list(&self) -> Vec<u32>;

    /// Whether `index` can be opened.
    fn can_open(&self, index: u32) -> bool {
        self.list().contains(&index)
    }
}

/// A fixed device list, taken from configuration.
#[derive(Debug, Clone)]
pub struct StaticCameras {
    indices: Vec<u32>,
}

impl StaticCameras {
    pub fn new(mut indices: Vec<u32>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Self { indices }
    }
}

impl CameraProbe for StaticCameras {
    fn list(&self) -> Vec<u32> {
        self.indices.clone()
    }
}

/// Errors raised by the capture stage.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera {0} could not be opened")]
    OpenFailed(u32),
    #[error("detector command is empty")]
    EmptyCommand,
    #[error("failed to open sample stream: {0}")]
    Stream(#[from] std::io::Error),
}

/// Frame budget in milliseconds for a target rate.
pub(crate) fn frame_budget(settings: &QosSettings) -> std::time::Duration {
    let fps = if settings.target_fps > 0.0 {
        settings.target_fps
    } else {
        1.0
    };
    std::time::Duration::from_secs_f64(1.0 / fps)
}
