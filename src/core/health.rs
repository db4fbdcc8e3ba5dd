//! Per-frame health evaluation and confidence scoring.

use crate::capture::types::{Acquisition, FeatureSample};
use crate::config::HealthConfig;
use serde::{Deserialize, Serialize};

/// Overall sensor condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    #[default]
    Ok,
    Degraded,
    /// Adaptation frozen until the cause clears
    Paused,
}

/// Named quality flags raised for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthFlags {
    pub low_light: bool,
    pub motion_blur: bool,
    pub camera_error: bool,
    /// Neither face nor pose detected
    pub no_subject: bool,
    /// Head turned or tilted past the configured limits
    pub looking_away: bool,
}

impl HealthFlags {
    pub fn any(&self) -> bool {
        self.low_light || self.motion_blur || self.camera_error || self.no_subject || self.looking_away
    }
}

/// Status plus flags, recomputed every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub flags: HealthFlags,
}

impl HealthStatus {
    pub fn is_paused(&self) -> bool {
        self.status == HealthState::Paused
    }
}

/// Evaluates frame quality. The only carried state is the run of
/// consecutive failed acquisitions.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    consecutive_failures: u32,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
        }
    }

    /// Evaluate the current frame.
    pub fn evaluate(&mut self, sample: Option<&FeatureSample>, acquisition_ok: bool) -> HealthStatus {
        if acquisition_ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        let mut flags = HealthFlags {
            camera_error: self.consecutive_failures >= self.config.camera_error_after.max(1),
            ..HealthFlags::default()
        };

        if let (true, Some(s)) = (acquisition_ok, sample) {
            flags.low_light = s.brightness < self.config.brightness_min;
            flags.motion_blur = s.blur_score > self.config.blur_max;
            flags.no_subject = !s.has_face && !s.has_pose;
            flags.looking_away = s.has_face
                && (s.yaw_proxy.abs() > self.config.max_abs_yaw
                    || s.roll_deg.abs() > self.config.max_abs_roll_deg);
        }

        let status = if flags.camera_error {
            HealthState::Paused
        } else if flags.any() {
            HealthState::Degraded
        } else {
            HealthState::Ok
        };

        HealthStatus { status, flags }
    }

    /// Evaluate straight from an acquisition outcome.
    pub fn evaluate_acquisition(&mut self, acquisition: &Acquisition) -> HealthStatus {
        self.evaluate(acquisition.sample(), acquisition.is_ok())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Overall confidence in this frame's measurement, 0-1.
    ///
    /// `0.4 * pose + 0.3 * eyes + 0.2 * face box + 0.1 * image quality`,
    /// where the face terms scale with the detector score and image quality is
    /// the worse of the brightness and sharpness ramps. Zero while the camera
    /// is failing.
    pub fn confidence(&self, sample: Option<&FeatureSample>, health: &HealthStatus) -> f64 {
        let sample = match sample {
            Some(s) if !health.flags.camera_error => s,
            _ => return 0.0,
        };

        let c_pose = if sample.pose_depth().is_some() { 1.0 } else { 0.0 };
        let face = sample.face_confidence();
        let c_eye = if sample.eye_dist > 0.0 { face } else { 0.0 };
        let c_box = if sample.bbox_area > 0.0 { face } else { 0.0 };

        let q_bright = ramp(
            sample.brightness,
            self.config.brightness_min,
            self.config.brightness_good,
        );
        // Blur is inverted: lower scores are better.
        let q_sharp = ramp(-sample.blur_score, -self.config.blur_max, -self.config.blur_good);
        let c_quality = q_bright.min(q_sharp);

        (0.4 * c_pose + 0.3 * c_eye + 0.2 * c_box + 0.1 * c_quality).clamp(0.0, 1.0)
    }
}

/// 0 at or below `min`, 1 at or above `good`, linear between.
fn ramp(value: f64, min: f64, good: f64) -> f64 {
    if !value.is_finite() || value <= min {
        return 0.0;
    }
    if value >= good || good <= min {
        return 1.0;
    }
    (value - min) / (good - min)
}
