//! Core signal processing for the Focus Sensor Agent.
//!
//! This module contains:
//! - Signal fusion into a smoothed nearness metric
//! - Frame health evaluation and confidence scoring
//! - The FOCUS/REVIEW hysteresis state machine
//! - Adaptive QoS control
//! - Calibration sessions and the persisted profile

pub mod calibration;
pub mod fuser;
pub mod health;
pub mod mode;
pub mod profile;
pub mod qos;

// Re-export commonly used types
pub use calibration::{
    CalibrationError, CalibrationPhaseStats, CalibrationStore, FaceMeans, Phase, PhaseOutcome,
    PhaseResult, RunningStats,
};
pub use fuser::{FaceScale, FusedMetric, FusionSource, SignalFuser};
pub use health::{HealthFlags, HealthMonitor, HealthState, HealthStatus};
pub use mode::{ModeMachine, ModeState, Thresholds, TransitionInfo};
pub use profile::{
    CalibrationProfile, FaceBaseline, JsonProfileStore, PhaseSummary, ProfileStore, StoreError,
};
pub use qos::{CpuSampler, PerfReport, QosController, QosOverride, QosSettings, QosStep};
