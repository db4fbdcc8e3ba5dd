//! Signal fusion: one nearness value per frame.
//!
//! Pose depth is preferred. Without pose, a face-size proxy built from eye
//! distance and bounding box area stands in. Without either, the previous value
//! is held. Output is on a `[0, 1]` scale where higher means nearer the camera.
//!
//! After calibration the face proxy is rescaled with a [`FaceScale`], so the
//! user's REVIEW face size lands on the REVIEW level of the fused metric and
//! likewise for FOCUS.

use crate::capture::types::FeatureSample;
use crate::config::FusionConfig;
use serde::{Deserialize, Serialize};

/// Which signal produced this frame's raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FusionSource {
    Pose,
    Face,
    /// Nothing detected; previous value carried forward
    Held,
}

/// This frame's fused value and its smoothed counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusedMetric {
    pub raw: f64,
    pub ema: f64,
    pub source: FusionSource,
}

impl FusedMetric {
    /// Whether this frame carried a fresh measurement.
    pub fn is_measured(&self) -> bool {
        self.source != FusionSource::Held
    }
}

/// Personal face-size mapping learned during calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceScale {
    /// `(far, near)` eye distance means
    pub eye_dist: Option<(f64, f64)>,
    /// `(far, near)` face box area means
    pub bbox_area: Option<(f64, f64)>,
    /// Fused metric level of the far (REVIEW) posture
    pub far_level: f64,
    /// Fused metric level of the near (FOCUS) posture
    pub near_level: f64,
}

impl FaceScale {
    fn map(&self, x: f64, range: (f64, f64)) -> Option<f64> {
        let (far, near) = range;
        if !x.is_finite() || (near - far).abs() < f64::EPSILON {
            return None;
        }
        let t = (x - far) / (near - far);
        Some((self.far_level + t * (self.near_level - self.far_level)).clamp(0.0, 1.0))
    }
}

/// Combines feature samples into a smoothed nearness metric.
#[derive(Debug, Clone)]
pub struct SignalFuser {
    config: FusionConfig,
    alpha: f64,
    raw: Option<f64>,
    ema: Option<f64>,
    face_scale: Option<FaceScale>,
}

impl SignalFuser {
    pub fn new(config: FusionConfig) -> Self {
        let alpha = if config.alpha.is_finite() {
            config.alpha.clamp(0.0, 1.0)
        } else {
            FusionConfig::default().alpha
        };
        Self {
            config,
            alpha,
            raw: None,
            ema: None,
            face_scale: None,
        }
    }

    /// Use a personal face-size mapping, or the configured ranges for `None`.
    pub fn set_face_scale(&mut self, scale: Option<FaceScale>) {
        self.face_scale = scale;
    }

    /// Fuse one sample. Never fails; missing inputs degrade to a held value.
    pub fn fuse(&mut self, sample: &FeatureSample) -> FusedMetric {
        let measured = self.measure(sample);
        let (raw, source) = match measured {
            Some(value) => value,
            None => (
                self.raw.unwrap_or(self.config.neutral),
                FusionSource::Held,
            ),
        };

        let ema = match self.ema {
            None => raw,
            Some(prev) => {
                let delta = self.config.winsor_delta.abs();
                let target = raw.clamp(prev - delta, prev + delta);
                prev + self.alpha * (target - prev)
            }
        };

        if measured.is_some() {
            self.raw = Some(raw);
        }
        self.ema = Some(ema);

        FusedMetric { raw, ema, source }
    }

    /// Forget history, e.g. after switching cameras.
    pub fn reset(&mut self) {
        self.raw = None;
        self.ema = None;
    }

    fn measure(&self, sample: &FeatureSample) -> Option<(f64, FusionSource)> {
        let cfg = &self.config;

        if let Some(z) = sample.pose_depth() {
            if let Some(v) = normalize_near(z, cfg.nose_z_far, cfg.nose_z_near) {
                return Some((v, FusionSource::Pose));
            }
        }

        if !sample.has_face {
            return None;
        }

        let scale = self.face_scale.as_ref();
        let eye = match scale.and_then(|s| s.eye_dist.map(|r| (s, r))) {
            Some((s, range)) => s.map(sample.eye_dist, range),
            None => normalize_near(sample.eye_dist, cfg.eye_dist_far, cfg.eye_dist_near),
        };
        let bbox = match scale.and_then(|s| s.bbox_area.map(|r| (s, r))) {
            Some((s, range)) => s.map(sample.bbox_area, range),
            None => normalize_near(sample.bbox_area, cfg.bbox_area_far, cfg.bbox_area_near),
        };
        let w = cfg.eye_weight.clamp(0.0, 1.0);
        let proxy = match (eye, bbox) {
            (Some(e), Some(b)) => w * e + (1.0 - w) * b,
            (Some(e), None) => e,
            (None, Some(b)) => b,
            (None, None) => return None,
        };
        Some((proxy, FusionSource::Face))
    }
}

/// Map `x` linearly so `far` is 0 and `near` is 1, clamped to `[0, 1]`.
fn normalize_near(x: f64, far: f64, near: f64) -> Option<f64> {
    if !x.is_finite() || (near - far).abs() < f64::EPSILON {
        return None;
    }
    Some(((x - far) / (near - far)).clamp(0.0, 1.0))
}
