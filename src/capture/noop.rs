//! Source used when no detector is attached.
//!
//! Every acquisition fails, so the health monitor reports `camera_error`
//! and the agent stays paused while the transport remains usable.

use crate::capture::types::Acquisition;
use crate::capture::{frame_budget, CaptureError, SampleSource};
use crate::core::qos::QosSettings;

/// A source that never produces frames.
#[derive(Debug, Default)]
pub struct NoopSource {
    camera: u32,
}

impl NoopSource {
    pub fn new(camera: u32) -> Self {
        Self { camera }
    }
}

impl SampleSource for NoopSource {
    fn next_sample(&mut self, settings: &QosSettings) -> Acquisition {
        std::thread::sleep(frame_budget(settings));
        Acquisition::Failed
    }

    fn switch_camera(&mut self, index: u32) -> Result<(), CaptureError> {
        self.camera = index;
        Ok(())
    }

    fn current_camera(&self) -> u32 {
        self.camera
    }
}
