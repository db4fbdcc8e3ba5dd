//! Per-frame feature samples produced by the external detector.
//!
//! These types carry ONLY landmark-derived geometry and image quality
//! statistics - never pixels.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// One processed frame worth of landmark features.
///
/// Immutable once produced. The detector may omit any field; missing
/// geometry is treated as "not detected" and missing quality figures as a
/// well-lit, sharp frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSample {
    /// Normalized distance between the eyes, 0-1 of frame width
    #[serde(default)]
    pub eye_dist: f64,
    /// Face bounding box area as a fraction of the frame
    #[serde(default)]
    pub bbox_area: f64,
    /// Head roll in degrees (eye line vs horizontal)
    #[serde(default)]
    pub roll_deg: f64,
    /// Log ratio of ear-to-nose distances; 0 when facing the camera
    #[serde(default)]
    pub yaw_proxy: f64,
    /// Nose world z x100, only present when pose landmarks were found
    #[serde(default)]
    pub nose_z: Option<f64>,
    #[serde(default)]
    pub has_face: bool,
    #[serde(default)]
    pub has_pose: bool,
    /// Face detector score; treated as 1.0 when a face is present without one
    #[serde(default)]
    pub face_score: Option<f64>,
    /// Mean grey level, 0-255
    #[serde(default = "default_brightness")]
    pub brightness: f64,
    /// Blurriness in 0-1, higher is blurrier
    #[serde(default)]
    pub blur_score: f64,
    /// Extraction time reported by the detector, if it measures one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_ms: Option<f64>,
    /// Monotonic agent-clock milliseconds, stamped by the source
    #[serde(default)]
    pub timestamp_ms: u64,
}

fn default_brightness() -> f64 {
    128.0
}

impl FeatureSample {
    /// A frame where nothing was detected.
    pub fn empty(timestamp_ms: u64) -> Self {
        Self {
            eye_dist: 0.0,
            bbox_area: 0.0,
            roll_deg: 0.0,
            yaw_proxy: 0.0,
            nose_z: None,
            has_face: false,
            has_pose: false,
            face_score: None,
            brightness: default_brightness(),
            blur_score: 0.0,
            processing_ms: None,
            timestamp_ms,
        }
    }

    /// Nose depth when the pose model produced one.
    pub fn pose_depth(&self) -> Option<f64> {
        if self.has_pose {
            self.nose_z.filter(|z| z.is_finite())
        } else {
            None
        }
    }

    /// Face detector score clamped to 0-1, zero without a face.
    pub fn face_confidence(&self) -> f64 {
        if !self.has_face {
            return 0.0;
        }
        self.face_score.unwrap_or(1.0).clamp(0.0, 1.0)
    }
}

/// Outcome of one attempt to grab and process a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// A frame was grabbed and features extracted
    Frame(FeatureSample),
    /// The device produced nothing usable this frame
    Failed,
}

impl Acquisition {
    pub fn is_ok(&self) -> bool {
        matches!(self, Acquisition::Frame(_))
    }

    pub fn sample(&self) -> Option<&FeatureSample> {
        match self {
            Acquisition::Frame(sample) => Some(sample),
            Acquisition::Failed => None,
        }
    }
}

/// Monotonic millisecond clock shared by every activity of the agent.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds since the clock was created.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
