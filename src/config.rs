//! Configuration for the Focus Sensor Agent.
//!
//! Every tuning constant the pipeline uses lives here so a deployment can
//! adjust it from `config.json` without a rebuild. Missing keys fall back to
//! the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Directory name used under the platform config/data roots.
pub const APP_DIR: &str = "focus-sensor-agent";

/// Main configuration for the sensor agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket port the editor client connects to
    pub port: u16,

    /// Camera index opened at startup
    pub camera: u32,

    /// Camera indices reported by the `cameras` command
    pub cameras: Vec<u32>,

    /// Signal fusion parameters
    pub fusion: FusionConfig,

    /// Health monitor thresholds
    pub health: HealthConfig,

    /// State machine defaults used before calibration
    pub mode: ModeConfig,

    /// Adaptive quality-of-service bounds
    pub qos: QosConfig,

    /// Calibration protocol policy
    pub calibration: CalibrationConfig,

    /// Path for storing session statistics
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            port: 8765,
            camera: 0,
            cameras: vec![0],
            fusion: FusionConfig::default(),
            health: HealthConfig::default(),
            mode: ModeConfig::default(),
            qos: QosConfig::default(),
            calibration: CalibrationConfig::default(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let mut config: Config = serde_json::from_str(&content)?;
            config.sanitize();
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Repair bound pairs a hand-edited file may have inverted or left
    /// non-finite, so later clamps cannot panic. Returns whether anything
    /// changed.
    pub fn sanitize(&mut self) -> bool {
        let mut changed = false;
        if self.mode.sanitize() {
            tracing::warn!("Invalid mode thresholds in config, using defaults");
            changed = true;
        }
        if self.qos.sanitize() {
            tracing::warn!("Inverted or invalid QoS bounds in config, repaired");
            changed = true;
        }
        if self.calibration.sanitize() {
            tracing::warn!("Inverted or invalid calibration bounds in config, repaired");
            changed = true;
        }
        changed
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Get the path of the persisted calibration profile.
    pub fn calibration_path() -> PathBuf {
        Self::config_dir().join("calibration.json")
    }

    fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        std::fs::create_dir_all(Self::config_dir())?;
        Ok(())
    }

    /// Path of the persisted session statistics.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("transparency.json")
    }
}

/// Signal fusion parameters.
///
/// The `*_far`/`*_near` pairs map a raw feature onto the `[0, 1]` nearness
/// scale: the far value maps to 0, the near value to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Fixed EMA smoothing factor
    pub alpha: f64,
    /// Largest step a single raw value may pull the EMA
    pub winsor_delta: f64,
    /// Value held before the first measured sample
    pub neutral: f64,
    pub nose_z_far: f64,
    pub nose_z_near: f64,
    pub eye_dist_far: f64,
    pub eye_dist_near: f64,
    pub bbox_area_far: f64,
    pub bbox_area_near: f64,
    /// Weight of eye distance in the face-only proxy (bbox gets the rest)
    pub eye_weight: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            winsor_delta: 0.35,
            neutral: 0.5,
            nose_z_far: -24.5,
            nose_z_near: -34.5,
            eye_dist_far: 0.08,
            eye_dist_near: 0.16,
            bbox_area_far: 0.04,
            bbox_area_near: 0.12,
            eye_weight: 0.75,
        }
    }
}

/// Health monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failed acquisitions before `camera_error`
    pub camera_error_after: u32,
    pub brightness_min: f64,
    pub brightness_good: f64,
    /// Blur score above which `motion_blur` is raised
    pub blur_max: f64,
    /// Blur score at or below which the frame counts as fully sharp
    pub blur_good: f64,
    pub max_abs_yaw: f64,
    pub max_abs_roll_deg: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            camera_error_after: 5,
            brightness_min: 60.0,
            brightness_good: 120.0,
            blur_max: 0.6,
            blur_good: 0.3,
            max_abs_yaw: 0.55,
            max_abs_roll_deg: 30.0,
        }
    }
}

/// State machine defaults used until a calibration profile exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub threshold_low: f64,
    pub threshold_high: f64,
    pub dwell_ms: u64,
    /// Minimum time between two committed flips (0 disables)
    pub min_flip_gap_ms: u64,
    /// Minimum confidence consumers should trust
    pub conf_min: f64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            threshold_low: 0.40,
            threshold_high: 0.60,
            dwell_ms: 750,
            min_flip_gap_ms: 1500,
            conf_min: 0.65,
        }
    }
}

impl ModeConfig {
    /// Reset a band that is not finite and ordered `low < high`.
    pub fn sanitize(&mut self) -> bool {
        let ok = self.threshold_low.is_finite()
            && self.threshold_high.is_finite()
            && self.threshold_low < self.threshold_high;
        if !ok {
            let defaults = Self::default();
            self.threshold_low = defaults.threshold_low;
            self.threshold_high = defaults.threshold_high;
        }
        !ok
    }
}

/// Adaptive quality-of-service bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub target_fps: f64,
    pub fps_min: f64,
    pub fps_max: f64,
    pub proc_scale: f64,
    pub proc_scale_min: f64,
    pub proc_scale_max: f64,
    pub proc_scale_step_down: f64,
    pub proc_scale_step_up: f64,
    pub fd_stride: u32,
    pub fd_stride_max: u32,
    pub pose_stride: u32,
    pub pose_stride_max: u32,
    /// Budget multiple above which the pipeline counts as overloaded
    pub overload_high: f64,
    /// Budget multiple below which a tick counts as comfortable
    pub overload_clear: f64,
    pub cpu_overload_pct: f64,
    /// Consecutive comfortable ticks before stepping back up
    pub recover_ticks: u32,
    pub adjust_period_ms: u64,
    pub rolling_samples: usize,
    pub heartbeat_ms: u64,
    pub heartbeat_overload_ms: u64,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            target_fps: 20.0,
            fps_min: 10.0,
            fps_max: 30.0,
            proc_scale: 0.75,
            proc_scale_min: 0.55,
            proc_scale_max: 0.90,
            proc_scale_step_down: 0.05,
            proc_scale_step_up: 0.03,
            fd_stride: 2,
            fd_stride_max: 4,
            pose_stride: 2,
            pose_stride_max: 3,
            overload_high: 1.10,
            overload_clear: 0.85,
            cpu_overload_pct: 85.0,
            recover_ticks: 3,
            adjust_period_ms: 1000,
            rolling_samples: 30,
            heartbeat_ms: 250,
            heartbeat_overload_ms: 500,
        }
    }
}

impl QosConfig {
    /// Order the min/max pairs and replace non-finite bounds with defaults.
    pub fn sanitize(&mut self) -> bool {
        let defaults = Self::default();
        let fps = order_bounds(
            &mut self.fps_min,
            &mut self.fps_max,
            (defaults.fps_min, defaults.fps_max),
        );
        let scale = order_bounds(
            &mut self.proc_scale_min,
            &mut self.proc_scale_max,
            (defaults.proc_scale_min, defaults.proc_scale_max),
        );
        fps | scale
    }
}

/// Calibration protocol policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Phase duration used when a command omits `duration_s`
    pub default_duration_s: f64,
    pub max_duration_s: f64,
    /// Samples a phase needs before its result counts
    pub min_samples: u64,
    /// Coefficient of variation at or below which a phase is stable
    pub stable_cv_max: f64,
    /// Dwell written into every finalized profile
    pub dwell_ms: u64,
    pub band_fraction: f64,
    pub band_min: f64,
    pub band_max: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            default_duration_s: 3.0,
            max_duration_s: 60.0,
            min_samples: 10,
            stable_cv_max: 0.10,
            dwell_ms: 750,
            band_fraction: 0.2,
            band_min: 0.02,
            band_max: 0.30,
        }
    }
}

impl CalibrationConfig {
    /// Order the band bounds and replace non-finite ones with defaults.
    pub fn sanitize(&mut self) -> bool {
        let defaults = Self::default();
        order_bounds(
            &mut self.band_min,
            &mut self.band_max,
            (defaults.band_min, defaults.band_max),
        )
    }
}

/// Make `min <= max` with both finite. Returns whether either was changed.
fn order_bounds(min: &mut f64, max: &mut f64, defaults: (f64, f64)) -> bool {
    if !min.is_finite() || !max.is_finite() {
        (*min, *max) = defaults;
        return true;
    }
    if *min > *max {
        std::mem::swap(min, max);
        return true;
    }
    false
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8765);
        assert_eq!(config.camera, 0);
        assert!(config.mode.threshold_low < config.mode.threshold_high);
        assert!(config.qos.proc_scale_min <= config.qos.proc_scale);
        assert!(config.qos.proc_scale <= config.qos.proc_scale_max);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"port": 9000, "qos": {"target_fps": 15.0}}"#)
            .expect("partial config should parse");
        assert_eq!(config.port, 9000);
        assert_eq!(config.qos.target_fps, 15.0);
        assert_eq!(config.qos.fd_stride_max, 4);
        assert_eq!(config.health.camera_error_after, 5);
    }

    #[test]
    fn test_sanitize_swaps_inverted_bounds() {
        let mut config: Config = serde_json::from_str(
            r#"{"qos": {"fps_min": 30.0, "fps_max": 10.0, "proc_scale_min": 0.9, "proc_scale_max": 0.5},
                "calibration": {"band_min": 0.3, "band_max": 0.02},
                "mode": {"threshold_low": 0.6, "threshold_high": 0.4}}"#,
        )
        .unwrap();
        assert!(config.sanitize());
        assert_eq!((config.qos.fps_min, config.qos.fps_max), (10.0, 30.0));
        assert_eq!((config.qos.proc_scale_min, config.qos.proc_scale_max), (0.5, 0.9));
        assert_eq!((config.calibration.band_min, config.calibration.band_max), (0.02, 0.3));
        assert_eq!((config.mode.threshold_low, config.mode.threshold_high), (0.40, 0.60));
        assert!(!config.sanitize());
    }

    #[test]
    fn test_sanitize_replaces_non_finite_bounds() {
        let mut qos = QosConfig {
            fps_max: f64::NAN,
            ..QosConfig::default()
        };
        assert!(qos.sanitize());
        assert_eq!((qos.fps_min, qos.fps_max), (10.0, 30.0));
        assert!(!Config::default().sanitize());
    }

    #[test]
    fn test_paths_share_app_dir() {
        let cfg = Config::config_path();
        let calib = Config::calibration_path();
        assert_eq!(cfg.parent(), calib.parent());
        assert!(calib.ends_with("calibration.json"));
    }
}
