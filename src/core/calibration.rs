//! Per-user calibration: two timed sampling phases and threshold derivation.
//!
//! The user holds their REVIEW posture, then their FOCUS posture, while the
//! fused metric is summarized with Welford's online algorithm. `finalize`
//! turns the two means into a hysteresis band around their midpoint.
//!
//! Eye distance and face box area are summarized alongside, so the face-size
//! fallback can be normalized against the user's own postures.

use crate::config::CalibrationConfig;
use crate::core::profile::{
    CalibrationProfile, FaceBaseline, PhaseSummary, PROFILE_METRIC, PROFILE_VERSION,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Posture being sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Review,
    Focus,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Review => write!(f, "REVIEW"),
            Phase::Focus => write!(f, "FOCUS"),
        }
    }
}

/// Online mean and population variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.m2 / self.n as f64).max(0.0)
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Face geometry samples needed before a phase reports a baseline.
pub const FACE_MIN_SAMPLES: u64 = 5;

/// Mean face geometry over one phase. `None` when too few frames had it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceMeans {
    pub eye_dist: Option<f64>,
    pub bbox_area: Option<f64>,
}

/// Statistics of the phase currently being sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPhaseStats {
    pub phase: Phase,
    /// Fused metric
    pub stats: RunningStats,
    pub eye: RunningStats,
    pub bbox: RunningStats,
    pub started_ms: u64,
    pub deadline_ms: u64,
}

impl CalibrationPhaseStats {
    /// Enough samples, and spread small relative to the mean.
    pub fn is_stable(&self, policy: &CalibrationConfig) -> bool {
        let n = self.stats.n();
        if n < policy.min_samples.max(1) {
            return false;
        }
        let mean = self.stats.mean().abs();
        let std = self.stats.std();
        if mean < f64::EPSILON {
            return std < f64::EPSILON;
        }
        std / mean <= policy.stable_cv_max
    }

    fn result(&self, policy: &CalibrationConfig) -> PhaseResult {
        PhaseResult {
            phase: self.phase,
            mean: self.stats.mean(),
            std: self.stats.std(),
            n: self.stats.n(),
            stable: self.is_stable(policy),
            face_means: FaceMeans {
                eye_dist: face_mean(&self.eye),
                bbox_area: face_mean(&self.bbox),
            },
        }
    }
}

fn face_mean(stats: &RunningStats) -> Option<f64> {
    (stats.n() >= FACE_MIN_SAMPLES).then(|| stats.mean())
}

/// Summary of a completed phase, as sent in `calib_result_phase`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub mean: f64,
    pub std: f64,
    pub n: u64,
    pub stable: bool,
    #[serde(default)]
    pub face_means: FaceMeans,
}

impl PhaseResult {
    fn summary(&self) -> PhaseSummary {
        PhaseSummary {
            mean: self.mean,
            std: self.std,
            n: self.n,
        }
    }
}

/// What happened when an active phase's window closed.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Completed(PhaseResult),
    Failed { phase: Phase, error: CalibrationError },
}

/// Calibration command failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("a calibration phase is already running")]
    Busy,
    #[error("duration must be in (0, {max}] seconds")]
    InvalidDuration { max: f64 },
    #[error("only {n} samples collected, need {required}")]
    InsufficientSamples { n: u64, required: u64 },
    #[error("both REVIEW and FOCUS phases must complete first")]
    MissingPhase,
    #[error("FOCUS mean must be nearer than REVIEW mean")]
    InvalidOrdering,
    #[error("failed to save profile: {0}")]
    PersistFailed(String),
}

impl CalibrationError {
    /// Wire `reason` code.
    pub fn reason(&self) -> &'static str {
        match self {
            CalibrationError::Busy => "busy",
            CalibrationError::InvalidDuration { .. } => "invalid_duration",
            CalibrationError::InsufficientSamples { .. } => "insufficient_samples",
            CalibrationError::MissingPhase => "missing_phase",
            CalibrationError::InvalidOrdering => "invalid_ordering",
            CalibrationError::PersistFailed(_) => "persist_failed",
        }
    }
}

/// The calibration session: at most one active phase plus the latest result
/// of each phase.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    policy: CalibrationConfig,
    active: Option<CalibrationPhaseStats>,
    review: Option<PhaseResult>,
    focus: Option<PhaseResult>,
}

impl CalibrationStore {
    pub fn new(mut policy: CalibrationConfig) -> Self {
        policy.sanitize();
        Self {
            policy,
            active: None,
            review: None,
            focus: None,
        }
    }

    /// Start sampling a phase. `duration_s` falls back to the configured
    /// default.
    pub fn begin_phase(
        &mut self,
        phase: Phase,
        duration_s: Option<f64>,
        now_ms: u64,
    ) -> Result<(), CalibrationError> {
        if self.active.is_some() {
            return Err(CalibrationError::Busy);
        }

        let duration_s = duration_s.unwrap_or(self.policy.default_duration_s);
        if !duration_s.is_finite() || duration_s <= 0.0 || duration_s > self.policy.max_duration_s {
            return Err(CalibrationError::InvalidDuration {
                max: self.policy.max_duration_s,
            });
        }

        let duration_ms = (duration_s * 1000.0).round() as u64;
        self.active = Some(CalibrationPhaseStats {
            phase,
            stats: RunningStats::default(),
            eye: RunningStats::default(),
            bbox: RunningStats::default(),
            started_ms: now_ms,
            deadline_ms: now_ms.saturating_add(duration_ms.max(1)),
        });
        tracing::info!(%phase, duration_s, "Calibration phase started");
        Ok(())
    }

    /// Feed one measured sample. Samples at or past the deadline close the
    /// phase instead of being counted.
    pub fn observe(&mut self, value: f64, now_ms: u64) -> Option<PhaseOutcome> {
        if let Some(outcome) = self.poll(now_ms) {
            return Some(outcome);
        }
        if let Some(active) = self.active.as_mut() {
            if value.is_finite() {
                active.stats.push(value);
            }
        }
        None
    }

    /// Feed the face geometry of one frame. Only positive finite values
    /// count; nothing is recorded once the deadline has passed.
    pub fn observe_face(&mut self, eye_dist: Option<f64>, bbox_area: Option<f64>, now_ms: u64) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if now_ms >= active.deadline_ms {
            return;
        }
        let usable = |v: &f64| v.is_finite() && *v > 0.0;
        if let Some(eye) = eye_dist.filter(usable) {
            active.eye.push(eye);
        }
        if let Some(bbox) = bbox_area.filter(usable) {
            active.bbox.push(bbox);
        }
    }

    /// Close the active phase if its window has elapsed.
    pub fn poll(&mut self, now_ms: u64) -> Option<PhaseOutcome> {
        let active = self.active?;
        if now_ms < active.deadline_ms {
            return None;
        }
        self.active = None;

        let required = self.policy.min_samples;
        if active.stats.n() < required {
            tracing::warn!(
                phase = %active.phase,
                n = active.stats.n(),
                required,
                "Calibration phase had too few samples"
            );
            return Some(PhaseOutcome::Failed {
                phase: active.phase,
                error: CalibrationError::InsufficientSamples {
                    n: active.stats.n(),
                    required,
                },
            });
        }

        let result = active.result(&self.policy);
        match result.phase {
            Phase::Review => self.review = Some(result),
            Phase::Focus => self.focus = Some(result),
        }
        tracing::info!(
            phase = %result.phase,
            mean = result.mean,
            std = result.std,
            n = result.n,
            stable = result.stable,
            "Calibration phase complete"
        );
        Some(PhaseOutcome::Completed(result))
    }

    pub fn active_phase(&self) -> Option<Phase> {
        self.active.map(|a| a.phase)
    }

    pub fn result(&self, phase: Phase) -> Option<&PhaseResult> {
        match phase {
            Phase::Review => self.review.as_ref(),
            Phase::Focus => self.focus.as_ref(),
        }
    }

    /// Derive a profile from both phase results. Does not persist.
    pub fn finalize(&self) -> Result<CalibrationProfile, CalibrationError> {
        let (review, focus) = match (self.review, self.focus) {
            (Some(r), Some(f)) => (r, f),
            _ => return Err(CalibrationError::MissingPhase),
        };

        if focus.mean.partial_cmp(&review.mean) != Some(std::cmp::Ordering::Greater) {
            return Err(CalibrationError::InvalidOrdering);
        }

        let mid = (review.mean + focus.mean) / 2.0;
        let band = (self.policy.band_fraction * (focus.mean - review.mean))
            .clamp(self.policy.band_min, self.policy.band_max);
        let threshold_low = mid - band / 2.0;
        let threshold_high = mid + band / 2.0;
        if threshold_low >= threshold_high {
            return Err(CalibrationError::InvalidOrdering);
        }

        Ok(CalibrationProfile {
            v: PROFILE_VERSION,
            metric: PROFILE_METRIC.to_string(),
            review: Some(review.summary()),
            focus: Some(focus.summary()),
            threshold_low,
            threshold_high,
            required_dwell_ms: self.policy.dwell_ms,
            face: Some(FaceBaseline {
                review: review.face_means,
                focus: focus.face_means,
            }),
            created_at: Some(Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::statistics::Statistics;

    fn store() -> CalibrationStore {
        CalibrationStore::new(CalibrationConfig::default())
    }

    /// Run a full phase feeding `values` 50 ms apart.
    fn run_phase(store: &mut CalibrationStore, phase: Phase, values: &[f64], start: u64) -> PhaseOutcome {
        store.begin_phase(phase, Some(1.0), start).unwrap();
        let mut t = start;
        for v in values {
            t += 50;
            if let Some(outcome) = store.observe(*v, t) {
                return outcome;
            }
        }
        store.poll(start + 1000).expect("phase should close at deadline")
    }

    #[test]
    fn test_welford_matches_two_pass() {
        let data = [0.31, 0.29, 0.35, 0.27, 0.33, 0.30, 0.28, 0.36, 0.32, 0.34, 1e-3, 0.9];
        let mut stats = RunningStats::default();
        for x in data {
            stats.push(x);
        }
        let mean = data.iter().mean();
        let var = data.iter().population_variance();
        assert!((stats.mean() - mean).abs() < 1e-12);
        assert!((stats.variance() - var).abs() < 1e-12);
        assert_eq!(stats.n(), data.len() as u64);
    }

    #[test]
    fn test_second_begin_is_busy() {
        let mut s = store();
        s.begin_phase(Phase::Review, Some(3.0), 0).unwrap();
        assert_eq!(s.begin_phase(Phase::Review, Some(3.0), 10), Err(CalibrationError::Busy));
        assert_eq!(s.begin_phase(Phase::Focus, Some(3.0), 10), Err(CalibrationError::Busy));
        assert_eq!(s.active_phase(), Some(Phase::Review));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let mut s = store();
        for d in [0.0, -1.0, f64::NAN, 61.0] {
            assert!(matches!(
                s.begin_phase(Phase::Focus, Some(d), 0),
                Err(CalibrationError::InvalidDuration { .. })
            ));
        }
        assert!(s.active_phase().is_none());
    }

    #[test]
    fn test_phase_completes_with_stable_result() {
        let mut s = store();
        let values = vec![0.30; 15];
        match run_phase(&mut s, Phase::Review, &values, 0) {
            PhaseOutcome::Completed(r) => {
                assert_eq!(r.phase, Phase::Review);
                assert_eq!(r.n, 15);
                assert!((r.mean - 0.30).abs() < 1e-12);
                assert!(r.stable);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(s.active_phase().is_none());
        assert!(s.result(Phase::Review).is_some());
    }

    #[test]
    fn test_noisy_phase_is_not_stable() {
        let mut s = store();
        let values: Vec<f64> = (0..15).map(|i| if i % 2 == 0 { 0.1 } else { 0.5 }).collect();
        match run_phase(&mut s, Phase::Focus, &values, 0) {
            PhaseOutcome::Completed(r) => assert!(!r.stable),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_too_few_samples_fails_phase() {
        let mut s = store();
        let outcome = run_phase(&mut s, Phase::Focus, &[0.7, 0.7, 0.7], 0);
        assert_eq!(
            outcome,
            PhaseOutcome::Failed {
                phase: Phase::Focus,
                error: CalibrationError::InsufficientSamples { n: 3, required: 10 },
            }
        );
        assert!(s.result(Phase::Focus).is_none());
    }

    #[test]
    fn test_finalize_requires_both_phases() {
        let mut s = store();
        run_phase(&mut s, Phase::Review, &[0.3; 12], 0);
        assert_eq!(s.finalize(), Err(CalibrationError::MissingPhase));
    }

    #[test]
    fn test_finalize_derives_band_around_midpoint() {
        let mut s = store();
        run_phase(&mut s, Phase::Review, &[0.3; 12], 0);
        run_phase(&mut s, Phase::Focus, &[0.7; 12], 2000);

        let profile = s.finalize().unwrap();
        // band = clamp(0.2 * 0.4, 0.02, 0.30) = 0.08
        assert!((profile.threshold_low - 0.46).abs() < 1e-9);
        assert!((profile.threshold_high - 0.54).abs() < 1e-9);
        assert_eq!(profile.required_dwell_ms, 750);
        assert!(profile.is_calibrated());
    }

    #[test]
    fn test_close_means_use_minimum_band() {
        let mut s = store();
        run_phase(&mut s, Phase::Review, &[0.50; 12], 0);
        run_phase(&mut s, Phase::Focus, &[0.52; 12], 2000);
        let profile = s.finalize().unwrap();
        assert!((profile.threshold_high - profile.threshold_low - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_face_means_collected_per_phase() {
        let mut s = store();
        s.begin_phase(Phase::Review, Some(1.0), 0).unwrap();
        for i in 1..=12u64 {
            s.observe_face(Some(0.09), Some(0.05), i * 50);
            s.observe(0.3, i * 50);
        }
        // A frame without a usable box only feeds eye distance.
        s.observe_face(Some(0.09), Some(0.0), 700);
        s.poll(1000);

        let review = *s.result(Phase::Review).unwrap();
        assert!((review.face_means.eye_dist.unwrap() - 0.09).abs() < 1e-12);
        assert!((review.face_means.bbox_area.unwrap() - 0.05).abs() < 1e-12);

        s.begin_phase(Phase::Focus, Some(1.0), 2000).unwrap();
        for i in 1..=12u64 {
            // Too few eye samples for a baseline.
            if i <= 3 {
                s.observe_face(Some(0.15), None, 2000 + i * 50);
            }
            s.observe(0.7, 2000 + i * 50);
        }
        s.poll(3000);
        let focus = s.result(Phase::Focus).unwrap();
        assert_eq!(focus.face_means, FaceMeans::default());

        let face = s.finalize().unwrap().face.unwrap();
        assert_eq!(face.review, review.face_means);
        assert_eq!(face.eye_dist_range(), None);
    }

    #[test]
    fn test_face_samples_after_deadline_ignored() {
        let mut s = store();
        s.begin_phase(Phase::Review, Some(1.0), 0).unwrap();
        for i in 1..=10u64 {
            s.observe_face(Some(0.1), None, i * 50);
            s.observe(0.3, i * 50);
        }
        // Late frames arrive before anything polls the expired phase.
        for i in 0..6u64 {
            s.observe_face(Some(0.5), None, 1000 + i);
        }
        assert_eq!(s.active_phase(), Some(Phase::Review));
        s.poll(1010);

        let review = s.result(Phase::Review).unwrap();
        assert!((review.face_means.eye_dist.unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_band_bounds_do_not_panic() {
        let mut s = CalibrationStore::new(CalibrationConfig {
            band_min: 0.30,
            band_max: 0.02,
            ..CalibrationConfig::default()
        });
        for (phase, value, start) in [(Phase::Review, 0.3, 0), (Phase::Focus, 0.7, 2000)] {
            s.begin_phase(phase, Some(1.0), start).unwrap();
            for i in 1..=12u64 {
                s.observe(value, start + i * 50);
            }
            s.poll(start + 1000);
        }
        let profile = s.finalize().unwrap();
        assert!((profile.threshold_high - profile.threshold_low - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_finalize_rejects_inverted_means() {
        let mut s = store();
        run_phase(&mut s, Phase::Review, &[0.7; 12], 0);
        run_phase(&mut s, Phase::Focus, &[0.3; 12], 2000);
        assert_eq!(s.finalize(), Err(CalibrationError::InvalidOrdering));
    }
}
