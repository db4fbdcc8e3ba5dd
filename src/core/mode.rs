//! FOCUS/REVIEW hysteresis automaton.
//!
//! Two thresholds form a band and a dwell timer debounces crossings:
//!
//! ```text
//!            ema >= high                    dwell elapsed
//!   REVIEW ─────────────▶ TRANSITION_TO_FOCUS ─────────────▶ FOCUS
//!     ▲                         │ ema < high                   │
//!     └─────────────────────────┘                              │ ema <= low
//!     ▲                                                        ▼
//!     └───────────── TRANSITION_TO_REVIEW ◀────────────────────┘
//!      dwell elapsed          │ ema > low ──▶ back to FOCUS
//! ```
//!
//! The metric is a nearness score: higher means leaning in (FOCUS).
//! Time spent paused does not count towards the dwell.

use serde::{Deserialize, Serialize};

/// Attention mode reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModeState {
    Focus,
    #[default]
    Review,
    TransitionToFocus,
    TransitionToReview,
}

impl ModeState {
    pub fn is_stable(self) -> bool {
        matches!(self, ModeState::Focus | ModeState::Review)
    }

    /// The stable state a transition settles into.
    pub fn target(self) -> Option<ModeState> {
        match self {
            ModeState::TransitionToFocus => Some(ModeState::Focus),
            ModeState::TransitionToReview => Some(ModeState::Review),
            _ => None,
        }
    }

    /// The stable state a transition started from.
    pub fn origin(self) -> ModeState {
        match self {
            ModeState::TransitionToFocus => ModeState::Review,
            ModeState::TransitionToReview => ModeState::Focus,
            stable => stable,
        }
    }
}

/// Hysteresis band and dwell, taken from the active calibration profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub high: f64,
    pub dwell_ms: u64,
}

/// Progress of an in-flight transition, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransitionInfo {
    pub target: Option<ModeState>,
    pub elapsed_ms: u64,
    pub required_ms: u64,
}

/// The 4-state mode automaton.
#[derive(Debug, Clone)]
pub struct ModeMachine {
    state: ModeState,
    transition_start_ms: Option<u64>,
    last_flip_ms: Option<u64>,
    min_flip_gap_ms: u64,
    required_ms: u64,
    /// First paused sample seen during an in-flight transition
    paused_since_ms: Option<u64>,
}

impl ModeMachine {
    /// A machine starting in REVIEW.
    pub fn new(min_flip_gap_ms: u64) -> Self {
        Self::with_state(ModeState::Review, min_flip_gap_ms)
    }

    /// A machine starting in the given stable state.
    pub fn with_state(state: ModeState, min_flip_gap_ms: u64) -> Self {
        Self {
            state: state.origin(),
            transition_start_ms: None,
            last_flip_ms: None,
            min_flip_gap_ms,
            required_ms: 0,
            paused_since_ms: None,
        }
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    /// The state to publish: while paused, the last committed stable state.
    pub fn reported_state(&self, paused: bool) -> ModeState {
        if paused {
            self.state.origin()
        } else {
            self.state
        }
    }

    /// Advance on one smoothed sample. A paused sensor leaves the machine
    /// untouched.
    pub fn update(&mut self, ema: f64, now_ms: u64, thresholds: &Thresholds, paused: bool) -> ModeState {
        if paused {
            if self.transition_start_ms.is_some() && self.paused_since_ms.is_none() {
                self.paused_since_ms = Some(now_ms);
            }
            return self.state;
        }
        if let Some(since) = self.paused_since_ms.take() {
            if let Some(start) = self.transition_start_ms.as_mut() {
                *start = start.saturating_add(now_ms.saturating_sub(since));
            }
        }
        if !ema.is_finite() {
            return self.state;
        }

        match self.state {
            ModeState::Review => {
                if ema >= thresholds.high && self.flip_allowed(now_ms) {
                    self.begin(ModeState::TransitionToFocus, now_ms, thresholds);
                }
            }
            ModeState::Focus => {
                if ema <= thresholds.low && self.flip_allowed(now_ms) {
                    self.begin(ModeState::TransitionToReview, now_ms, thresholds);
                }
            }
            ModeState::TransitionToFocus => {
                if ema < thresholds.high {
                    self.cancel();
                } else if self.elapsed_ms(now_ms) >= thresholds.dwell_ms {
                    self.commit(ModeState::Focus, now_ms);
                }
            }
            ModeState::TransitionToReview => {
                if ema > thresholds.low {
                    self.cancel();
                } else if self.elapsed_ms(now_ms) >= thresholds.dwell_ms {
                    self.commit(ModeState::Review, now_ms);
                }
            }
        }

        self.state
    }

    /// Telemetry view of the current transition.
    pub fn transition(&self, now_ms: u64) -> TransitionInfo {
        match self.state.target() {
            Some(target) => TransitionInfo {
                target: Some(target),
                elapsed_ms: self.elapsed_ms(now_ms),
                required_ms: self.required_ms,
            },
            None => TransitionInfo::default(),
        }
    }

    fn flip_allowed(&self, now_ms: u64) -> bool {
        match self.last_flip_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.min_flip_gap_ms,
            None => true,
        }
    }

    fn elapsed_ms(&self, now_ms: u64) -> u64 {
        self.transition_start_ms
            .map(|start| now_ms.saturating_sub(start))
            .unwrap_or(0)
    }

    fn begin(&mut self, transition: ModeState, now_ms: u64, thresholds: &Thresholds) {
        tracing::debug!(from = ?self.state, to = ?transition, "mode transition started");
        self.state = transition;
        self.transition_start_ms = Some(now_ms);
        self.required_ms = thresholds.dwell_ms;
    }

    fn cancel(&mut self) {
        tracing::debug!(from = ?self.state, "mode transition cancelled");
        self.state = self.state.origin();
        self.transition_start_ms = None;
        self.required_ms = 0;
    }

    fn commit(&mut self, stable: ModeState, now_ms: u64) {
        self.state = stable;
        self.transition_start_ms = None;
        self.required_ms = 0;
        self.last_flip_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(dwell_ms: u64) -> Thresholds {
        Thresholds {
            low: 0.40,
            high: 0.60,
            dwell_ms,
        }
    }

    #[test]
    fn test_starts_in_review() {
        assert_eq!(ModeMachine::new(0).state(), ModeState::Review);
    }

    #[test]
    fn test_scenario_focus_to_review() {
        let th = band(500);
        let mut machine = ModeMachine::with_state(ModeState::Focus, 0);
        let mut t = 0;

        for _ in 0..5 {
            t += 100;
            assert_eq!(machine.update(0.65, t, &th, false), ModeState::Focus);
        }

        let mut seen = Vec::new();
        for _ in 0..6 {
            t += 100;
            seen.push(machine.update(0.30, t, &th, false));
        }
        assert_eq!(seen[0], ModeState::TransitionToReview);
        assert!(seen[1..5].iter().all(|s| *s == ModeState::TransitionToReview));
        assert_eq!(seen[5], ModeState::Review);
    }

    #[test]
    fn test_constant_high_commits_focus_after_dwell() {
        let th = band(750);
        let mut machine = ModeMachine::new(0);
        assert_eq!(machine.update(0.7, 1000, &th, false), ModeState::TransitionToFocus);
        assert_eq!(machine.update(0.7, 1700, &th, false), ModeState::TransitionToFocus);
        assert_eq!(machine.update(0.7, 1750, &th, false), ModeState::Focus);
    }

    #[test]
    fn test_revert_before_dwell_cancels() {
        let th = band(750);
        let mut machine = ModeMachine::new(0);
        machine.update(0.7, 0, &th, false);
        assert_eq!(machine.update(0.5, 300, &th, false), ModeState::Review);
        assert_eq!(machine.transition(300), TransitionInfo::default());
    }

    #[test]
    fn test_band_interior_holds_state() {
        let th = band(100);
        let mut machine = ModeMachine::with_state(ModeState::Focus, 0);
        for t in 0..20 {
            assert_eq!(machine.update(0.5, t * 100, &th, false), ModeState::Focus);
        }
    }

    #[test]
    fn test_never_jumps_between_stable_states() {
        let th = band(0);
        let mut machine = ModeMachine::new(0);
        let values = [0.9, 0.1, 0.9, 0.9, 0.1, 0.1, 0.5, 0.95, 0.05, 0.05];
        let mut prev = machine.state();
        for (i, v) in values.iter().enumerate() {
            let next = machine.update(*v, i as u64 * 10, &th, false);
            if prev.is_stable() && next.is_stable() {
                assert_eq!(prev, next, "direct flip at step {i}");
            }
            prev = next;
        }
    }

    #[test]
    fn test_paused_freezes_machine() {
        let th = band(100);
        let mut machine = ModeMachine::new(0);
        machine.update(0.9, 0, &th, false);
        assert_eq!(machine.update(0.9, 500, &th, true), ModeState::TransitionToFocus);
        assert_eq!(machine.reported_state(true), ModeState::Review);
        assert_eq!(machine.reported_state(false), ModeState::TransitionToFocus);
    }

    #[test]
    fn test_dwell_excludes_paused_span() {
        let th = band(500);
        let mut machine = ModeMachine::new(0);
        machine.update(0.9, 0, &th, false);
        for t in (100..=1000).step_by(100) {
            machine.update(0.9, t, &th, true);
        }

        // Only the 100 ms before the pause count, so the dwell is not done yet.
        assert_eq!(machine.update(0.9, 1100, &th, false), ModeState::TransitionToFocus);
        assert_eq!(machine.transition(1100).elapsed_ms, 100);
        assert_eq!(machine.update(0.9, 1400, &th, false), ModeState::TransitionToFocus);
        assert_eq!(machine.update(0.9, 1500, &th, false), ModeState::Focus);
    }

    #[test]
    fn test_pause_outside_transition_changes_nothing() {
        let th = band(500);
        let mut machine = ModeMachine::new(0);
        machine.update(0.5, 0, &th, true);
        assert_eq!(machine.update(0.9, 2000, &th, false), ModeState::TransitionToFocus);
        assert_eq!(machine.update(0.9, 2500, &th, false), ModeState::Focus);
    }

    #[test]
    fn test_threshold_edges_are_inclusive() {
        let th = band(200);
        let mut machine = ModeMachine::new(0);
        assert_eq!(machine.update(0.60, 0, &th, false), ModeState::TransitionToFocus);
        assert_eq!(machine.update(0.60, 100, &th, false), ModeState::TransitionToFocus);
        assert_eq!(machine.update(0.60, 200, &th, false), ModeState::Focus);

        assert_eq!(machine.update(0.40, 300, &th, false), ModeState::TransitionToReview);
        // Strictly back inside the band cancels.
        assert_eq!(machine.update(0.41, 400, &th, false), ModeState::Focus);
    }

    #[test]
    fn test_min_flip_gap_blocks_quick_reversal() {
        let th = band(0);
        let mut machine = ModeMachine::new(1500);
        machine.update(0.9, 0, &th, false);
        assert_eq!(machine.update(0.9, 10, &th, false), ModeState::Focus);

        assert_eq!(machine.update(0.1, 500, &th, false), ModeState::Focus);
        assert_eq!(machine.update(0.1, 1510, &th, false), ModeState::TransitionToReview);
    }

    #[test]
    fn test_transition_info_reports_progress() {
        let th = band(750);
        let mut machine = ModeMachine::new(0);
        machine.update(0.8, 1000, &th, false);
        let info = machine.transition(1300);
        assert_eq!(info.target, Some(ModeState::Focus));
        assert_eq!(info.elapsed_ms, 300);
        assert_eq!(info.required_ms, 750);
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        let json = serde_json::to_string(&ModeState::TransitionToFocus).unwrap();
        assert_eq!(json, "\"TRANSITION_TO_FOCUS\"");
    }
}
