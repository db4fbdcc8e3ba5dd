//! Durable per-user calibration profile and its storage.

use crate::config::ModeConfig;
use crate::core::calibration::FaceMeans;
use crate::core::fuser::FaceScale;
use crate::core::mode::Thresholds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Profile format version.
pub const PROFILE_VERSION: u32 = 4;

/// Name of the metric the thresholds apply to.
pub const PROFILE_METRIC: &str = "fused_nearness";

/// Summary of one completed calibration phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub mean: f64,
    pub std: f64,
    pub n: u64,
}

/// Face geometry means of both postures, used to personalise the face-size
/// fallback when pose depth is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceBaseline {
    pub review: FaceMeans,
    pub focus: FaceMeans,
}

impl FaceBaseline {
    /// `(far, near)` eye distance, when both postures have a distinct mean.
    pub fn eye_dist_range(&self) -> Option<(f64, f64)> {
        distinct(self.review.eye_dist, self.focus.eye_dist)
    }

    /// `(far, near)` face box area, when both postures have a distinct mean.
    pub fn bbox_area_range(&self) -> Option<(f64, f64)> {
        distinct(self.review.bbox_area, self.focus.bbox_area)
    }
}

fn distinct(far: Option<f64>, near: Option<f64>) -> Option<(f64, f64)> {
    let (far, near) = (far?, near?);
    (far.is_finite() && near.is_finite() && (near - far).abs() > f64::EPSILON)
        .then_some((far, near))
}

/// Personalized thresholds and the phase statistics they came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub v: u32,
    pub metric: String,
    /// `None` until the user has calibrated
    pub review: Option<PhaseSummary>,
    pub focus: Option<PhaseSummary>,
    pub threshold_low: f64,
    pub threshold_high: f64,
    pub required_dwell_ms: u64,
    /// Absent in profiles written before face baselines existed
    #[serde(default)]
    pub face: Option<FaceBaseline>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl CalibrationProfile {
    /// The uncalibrated profile built from configured defaults.
    pub fn from_defaults(mode: &ModeConfig) -> Self {
        Self {
            v: PROFILE_VERSION,
            metric: PROFILE_METRIC.to_string(),
            review: None,
            focus: None,
            threshold_low: mode.threshold_low,
            threshold_high: mode.threshold_high,
            required_dwell_ms: mode.dwell_ms,
            face: None,
            created_at: None,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            low: self.threshold_low,
            high: self.threshold_high,
            dwell_ms: self.required_dwell_ms,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.review.is_some() && self.focus.is_some()
    }

    /// Face-size mapping onto the calibrated metric levels. `None` unless
    /// both phases are recorded and at least one face channel separates them.
    pub fn face_scale(&self) -> Option<FaceScale> {
        let (review, focus, face) = (self.review?, self.focus?, self.face?);
        let eye_dist = face.eye_dist_range();
        let bbox_area = face.bbox_area_range();
        if eye_dist.is_none() && bbox_area.is_none() {
            return None;
        }
        Some(FaceScale {
            eye_dist,
            bbox_area,
            far_level: review.mean,
            near_level: focus.mean,
        })
    }

    /// The band must be finite and ordered low < high.
    pub fn is_valid(&self) -> bool {
        self.threshold_low.is_finite()
            && self.threshold_high.is_finite()
            && self.threshold_low < self.threshold_high
    }
}

/// Errors raised by profile storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("stored profile has an invalid threshold band")]
    Invalid,
}

/// Persistence collaborator for the calibration profile.
pub trait ProfileStore: Send + Sync {
    /// Read the stored profile. `Ok(None)` when nothing has been saved.
    fn load(&self) -> Result<Option<CalibrationProfile>, StoreError>;

    /// Replace the stored profile.
    fn save(&self, profile: &CalibrationProfile) -> Result<(), StoreError>;
}

/// Stores the profile as pretty JSON, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonProfileStore {
    fn load(&self) -> Result<Option<CalibrationProfile>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let profile: CalibrationProfile = serde_json::from_str(&content)?;
        if !profile.is_valid() {
            return Err(StoreError::Invalid);
        }
        Ok(Some(profile))
    }

    fn save(&self, profile: &CalibrationProfile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(profile)?;

        // Write beside the target and rename over it so readers never see a
        // half-written file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Load the stored profile, falling back to defaults when absent or unusable.
pub fn load_or_default(store: &dyn ProfileStore, mode: &ModeConfig) -> CalibrationProfile {
    match store.load() {
        Ok(Some(profile)) => {
            tracing::info!(
                low = profile.threshold_low,
                high = profile.threshold_high,
                dwell_ms = profile.required_dwell_ms,
                "Loaded calibration profile"
            );
            profile
        }
        Ok(None) => {
            tracing::info!("No calibration profile; using defaults");
            CalibrationProfile::from_defaults(mode)
        }
        Err(e) => {
            tracing::warn!("Ignoring stored calibration profile: {}", e);
            CalibrationProfile::from_defaults(mode)
        }
    }
}
