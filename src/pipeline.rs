//! The per-frame activity.
//!
//! For every acquisition: health, then fusion, then the calibration feed,
//! then the mode machine. The result is published as a [`Telemetry`]
//! snapshot that the transport reads on its own cadence.

use crate::agent::Agent;
use crate::capture::types::{Acquisition, FeatureSample};
use crate::capture::SampleSource;
use crate::config::Config;
use crate::core::fuser::{FusedMetric, FusionSource, SignalFuser};
use crate::core::health::{HealthMonitor, HealthStatus};
use crate::core::mode::{ModeMachine, ModeState, TransitionInfo};
use crate::protocol::Event;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latest per-frame results, as read by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// State to publish (the held stable state while paused)
    pub state: ModeState,
    pub paused: bool,
    pub fps: f64,
    pub nose_z: Option<f64>,
    pub confidence: f64,
    pub features: Option<FeatureSample>,
    pub fused: FusedMetric,
    pub health: HealthStatus,
    pub transition: TransitionInfo,
    pub timestamp_ms: u64,
}

impl Telemetry {
    /// Snapshot before the first frame: REVIEW, neutral metric.
    pub fn initial(neutral: f64) -> Self {
        Self {
            state: ModeState::Review,
            paused: false,
            fps: 0.0,
            nose_z: None,
            confidence: 0.0,
            features: None,
            fused: FusedMetric {
                raw: neutral,
                ema: neutral,
                source: FusionSource::Held,
            },
            health: HealthStatus::default(),
            transition: TransitionInfo::default(),
            timestamp_ms: 0,
        }
    }
}

/// Frames per second over roughly one-second windows.
#[derive(Debug, Default)]
struct FpsMeter {
    window_start_ms: Option<u64>,
    frames: u32,
    fps: f64,
}

impl FpsMeter {
    fn tick(&mut self, now_ms: u64) -> f64 {
        let start = *self.window_start_ms.get_or_insert(now_ms);
        self.frames += 1;
        let elapsed = now_ms.saturating_sub(start);
        if elapsed >= 1000 {
            self.fps = (f64::from(self.frames) * 1000.0 / elapsed as f64 * 10.0).round() / 10.0;
            self.frames = 0;
            self.window_start_ms = Some(now_ms);
        }
        self.fps
    }
}

/// Owns the single-writer per-frame state: fuser, health monitor and mode
/// machine.
#[derive(Debug)]
pub struct FramePipeline {
    fuser: SignalFuser,
    health: HealthMonitor,
    machine: ModeMachine,
    fps: FpsMeter,
}

impl FramePipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            fuser: SignalFuser::new(config.fusion.clone()),
            health: HealthMonitor::new(config.health.clone()),
            machine: ModeMachine::new(config.mode.min_flip_gap_ms),
            fps: FpsMeter::default(),
        }
    }

    pub fn state(&self) -> ModeState {
        self.machine.state()
    }

    /// Forget the smoothed signal, e.g. after a camera switch.
    pub fn reset_signal(&mut self) {
        self.fuser.reset();
    }

    /// Run one acquisition through the pipeline and publish the result.
    pub fn process(&mut self, agent: &Agent, acquisition: &Acquisition, now_ms: u64) -> Telemetry {
        let log = agent.transparency();
        if acquisition.is_ok() {
            log.record_frame();
        } else {
            log.record_failed_frame();
        }

        let health = self.health.evaluate_acquisition(acquisition);
        let paused = health.is_paused();
        let sample = acquisition.sample();

        self.fuser.set_face_scale(agent.face_scale());
        let fused = match sample {
            Some(s) => self.fuser.fuse(s),
            None => self.fuser.fuse(&FeatureSample::empty(now_ms)),
        };

        let face = sample
            .filter(|s| s.has_face && !paused)
            .map(|s| (Some(s.eye_dist), Some(s.bbox_area)));
        let outcome = agent.with_calibration(|c| {
            if let Some((eye_dist, bbox_area)) = face {
                c.observe_face(eye_dist, bbox_area, now_ms);
            }
            if fused.is_measured() && !paused {
                c.observe(fused.raw, now_ms)
            } else {
                c.poll(now_ms)
            }
        });
        if let Some(outcome) = outcome {
            agent.publish(Event::from(outcome));
        }

        let before = self.machine.state();
        let thresholds = agent.thresholds();
        let after = self.machine.update(fused.ema, now_ms, &thresholds, paused);
        if before.target() == Some(after) {
            log.record_state_change();
            tracing::info!(state = ?after, ema = fused.ema, "Mode changed");
        }

        let telemetry = Telemetry {
            state: self.machine.reported_state(paused),
            paused,
            fps: self.fps.tick(now_ms),
            nose_z: sample.and_then(FeatureSample::pose_depth),
            confidence: self.health.confidence(sample, &health),
            features: sample.cloned(),
            fused,
            health,
            transition: self.machine.transition(now_ms),
            timestamp_ms: now_ms,
        };
        agent.set_telemetry(telemetry.clone());
        telemetry
    }
}

/// Drive the pipeline from `source` until shutdown is requested.
///
/// Runs on a dedicated thread. The source is dropped, releasing the device,
/// before this returns.
pub fn run_capture_loop(agent: Arc<Agent>, mut source: Box<dyn SampleSource>) {
    let mut pipeline = FramePipeline::new(agent.config());
    tracing::info!(camera = source.current_camera(), "Capture loop started");

    while !agent.is_shutdown() {
        if let Some(index) = agent.take_camera_request() {
            match source.switch_camera(index) {
                Ok(()) => {
                    agent.set_current_camera(index);
                    pipeline.reset_signal();
                    tracing::info!(camera = index, "Switched camera");
                }
                Err(e) => tracing::warn!("Camera switch failed: {}", e),
            }
        }

        let settings = agent.qos_settings();
        let frame_start = Instant::now();
        let acquisition = source.next_sample(&settings);

        let work_start = Instant::now();
        let now_ms = agent.clock().now_ms();
        pipeline.process(&agent, &acquisition, now_ms);

        if let Some(sample) = acquisition.sample() {
            let pipeline_ms = work_start.elapsed().as_secs_f64() * 1000.0;
            let detector_ms = sample.processing_ms.unwrap_or(0.0);
            agent.record_frame_time(detector_ms + pipeline_ms);
        }

        // Cap the loop at target_fps.
        let budget = Duration::from_secs_f64(1.0 / settings.target_fps.max(1.0));
        if let Some(rest) = budget.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    drop(source);
    tracing::info!("Capture loop stopped, source released");
}
