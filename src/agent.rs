//! Process-lifetime shared state and command dispatch.
//!
//! One [`Agent`] exists per process. It outlives every client connection, so
//! reconnecting never resets an in-progress calibration or the QoS state.

use crate::capture::types::Clock;
use crate::capture::CameraProbe;
use crate::config::Config;
use crate::core::calibration::{CalibrationError, CalibrationStore};
use crate::core::fuser::FaceScale;
use crate::core::mode::Thresholds;
use crate::core::profile::{self, CalibrationProfile, ProfileStore};
use crate::core::qos::{CpuSampler, QosController, QosSettings};
use crate::pipeline::Telemetry;
use crate::protocol::{Ack, Command, Event, Heartbeat};
use crate::transparency::SharedTransparencyLog;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Capacity of the asynchronous event channel.
const EVENT_CAPACITY: usize = 64;

/// Interval at which an active calibration phase is checked for expiry
/// when no frames arrive.
const CALIBRATION_POLL: Duration = Duration::from_millis(100);

/// Shared state behind every activity of the sensor.
pub struct Agent {
    config: Config,
    clock: Clock,
    profile: RwLock<CalibrationProfile>,
    qos: Mutex<QosController>,
    calibration: Mutex<CalibrationStore>,
    telemetry: RwLock<Telemetry>,
    conf_min: RwLock<f64>,
    cameras: Box<dyn CameraProbe>,
    current_camera: AtomicU32,
    camera_request: Mutex<Option<u32>>,
    events: broadcast::Sender<Event>,
    shutdown: watch::Sender<bool>,
    store: Box<dyn ProfileStore>,
    transparency: SharedTransparencyLog,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("current_camera", &self.current_camera.load(Ordering::Relaxed))
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Build the agent, loading the stored calibration profile.
    pub fn new(
        mut config: Config,
        store: Box<dyn ProfileStore>,
        cameras: Box<dyn CameraProbe>,
        transparency: SharedTransparencyLog,
    ) -> Self {
        config.sanitize();
        let profile = profile::load_or_default(store.as_ref(), &config.mode);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            clock: Clock::new(),
            profile: RwLock::new(profile),
            qos: Mutex::new(QosController::new(config.qos.clone())),
            calibration: Mutex::new(CalibrationStore::new(config.calibration.clone())),
            telemetry: RwLock::new(Telemetry::initial(config.fusion.neutral)),
            conf_min: RwLock::new(config.mode.conf_min.clamp(0.0, 1.0)),
            current_camera: AtomicU32::new(config.camera),
            camera_request: Mutex::new(None),
            cameras,
            events,
            shutdown,
            store,
            transparency,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn transparency(&self) -> &SharedTransparencyLog {
        &self.transparency
    }

    /// Handle one client command. Runs synchronously; persistence happens
    /// here, so call it off the async reactor.
    pub fn dispatch(&self, command: Command) -> Vec<Event> {
        tracing::debug!(?command, "Dispatching command");
        match command {
            Command::CalibratePhase { phase, duration_s } => {
                let now_ms = self.clock.now_ms();
                match self.with_calibration(|c| c.begin_phase(phase, duration_s, now_ms)) {
                    Ok(()) => vec![Event::sampling(phase)],
                    Err(e) => {
                        tracing::warn!(%phase, "Calibration phase rejected: {}", e);
                        vec![Event::calib_error(Some(phase), &e)]
                    }
                }
            }
            Command::CalibrateFinalize => vec![self.finalize_calibration()],
            Command::SetConfMin { value } => {
                let mut ack = Ack::ok("set_conf_min");
                if value.is_finite() {
                    let value = value.clamp(0.0, 1.0);
                    *self.conf_min.write().unwrap_or_else(|e| e.into_inner()) = value;
                    ack.value = Some(value);
                } else {
                    ack.ok = false;
                    ack.reason = Some("invalid_value");
                }
                vec![Event::Ack(ack)]
            }
            Command::SetQos(update) => {
                let settings = self.lock_qos().apply_override(&update);
                tracing::info!(?settings, "QoS overridden by client");
                let mut ack = Ack::ok("set_qos");
                ack.qos = Some(settings);
                vec![Event::Ack(ack)]
            }
            Command::Cameras => vec![Event::Cameras {
                list: self.cameras.list(),
                current: self.current_camera(),
            }],
            Command::SwitchCamera { index } => {
                let mut ack = Ack::ok("switch_camera");
                ack.index = Some(index);
                if self.cameras.can_open(index) {
                    *self.camera_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(index);
                } else {
                    ack.ok = false;
                    ack.reason = Some("open_failed");
                }
                vec![Event::Ack(ack)]
            }
            Command::Shutdown => {
                self.request_shutdown();
                vec![Event::Ack(Ack::ok("shutdown"))]
            }
        }
    }

    fn finalize_calibration(&self) -> Event {
        // Derive under the lock, persist after releasing it.
        let derived = self.with_calibration(|c| c.finalize());
        let profile = match derived {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!("Calibration finalize rejected: {}", e);
                return Event::calib_error(None, &e);
            }
        };

        let saved = self.store.save(&profile);
        self.apply_profile(profile.clone());
        match saved {
            Ok(()) => {
                self.transparency.record_calibration_saved();
                tracing::info!(
                    low = profile.threshold_low,
                    high = profile.threshold_high,
                    "Calibration profile saved"
                );
                Event::CalibDone { saved: profile }
            }
            Err(e) => {
                tracing::warn!("Calibration profile kept in memory only: {}", e);
                Event::calib_error(None, &CalibrationError::PersistFailed(e.to_string()))
            }
        }
    }

    /// Run `f` with exclusive access to the calibration session.
    pub fn with_calibration<R>(&self, f: impl FnOnce(&mut CalibrationStore) -> R) -> R {
        let mut calibration = self.calibration.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut calibration)
    }

    pub fn profile(&self) -> CalibrationProfile {
        self.profile.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Band and dwell of the active profile, read on every frame.
    pub fn thresholds(&self) -> Thresholds {
        self.profile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .thresholds()
    }

    /// Personal face-size mapping from the active profile, if any.
    pub fn face_scale(&self) -> Option<FaceScale> {
        self.profile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .face_scale()
    }

    /// Make `profile` the active one for the rest of the session.
    pub fn apply_profile(&self, profile: CalibrationProfile) {
        *self.profile.write().unwrap_or_else(|e| e.into_inner()) = profile;
    }

    pub fn conf_min(&self) -> f64 {
        *self.conf_min.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_qos(&self) -> std::sync::MutexGuard<'_, QosController> {
        self.qos.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn qos_settings(&self) -> QosSettings {
        self.lock_qos().settings()
    }

    pub fn record_frame_time(&self, processing_ms: f64) {
        self.lock_qos().record_frame(processing_ms);
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.lock_qos().heartbeat_interval()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_telemetry(&self, telemetry: Telemetry) {
        *self.telemetry.write().unwrap_or_else(|e| e.into_inner()) = telemetry;
    }

    /// Build a heartbeat from an already-read snapshot.
    pub fn heartbeat(&self, telemetry: &Telemetry) -> Heartbeat {
        Heartbeat {
            fps: telemetry.fps,
            metric_nose_z_x100: telemetry.nose_z,
            confidence: (telemetry.confidence * 1000.0).round() / 1000.0,
            conf_min: self.conf_min(),
            paused: telemetry.paused,
            features: telemetry.features.clone(),
            fused: telemetry.fused,
            health: telemetry.health,
            perf: self.lock_qos().perf(),
            transition: telemetry.transition,
        }
    }

    pub fn current_camera(&self) -> u32 {
        self.current_camera.load(Ordering::Relaxed)
    }

    pub fn set_current_camera(&self, index: u32) {
        self.current_camera.store(index, Ordering::Relaxed);
    }

    /// Take the pending camera switch, if any.
    pub fn take_camera_request(&self) -> Option<u32> {
        self.camera_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Send an asynchronous event to every connected client. Best effort.
    pub fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::info!("Shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// A throwaway agent with default config and no persistence.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use crate::capture::StaticCameras;
        use crate::core::profile::StoreError;
        use crate::transparency::TransparencyLog;

        struct MemoryStore;
        impl ProfileStore for MemoryStore {
            fn load(&self) -> Result<Option<CalibrationProfile>, StoreError> {
                Ok(None)
            }
            fn save(&self, _: &CalibrationProfile) -> Result<(), StoreError> {
                Ok(())
            }
        }

        Self::new(
            Config::default(),
            Box::new(MemoryStore),
            Box::new(StaticCameras::new(vec![0, 1])),
            Arc::new(TransparencyLog::new()),
        )
    }
}

/// QoS ticks and calibration expiry checks, until shutdown.
pub async fn run_background(agent: Arc<Agent>) {
    let mut qos_tick = tokio::time::interval(Duration::from_millis(
        agent.config().qos.adjust_period_ms.max(100),
    ));
    let mut calib_tick = tokio::time::interval(CALIBRATION_POLL);
    let mut shutdown = agent.shutdown_signal();
    let mut cpu = CpuSampler::new();

    loop {
        tokio::select! {
            _ = qos_tick.tick() => {
                // Adaptation is frozen while the sensor is paused.
                if agent.telemetry().paused {
                    continue;
                }
                let cpu_pct = cpu.sample();
                if let Some(step) = agent.lock_qos().tick(cpu_pct) {
                    tracing::info!("QoS step: {}", step);
                }
            }
            _ = calib_tick.tick() => {
                let now_ms = agent.clock().now_ms();
                if let Some(outcome) = agent.with_calibration(|c| c.poll(now_ms)) {
                    agent.publish(Event::from(outcome));
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
        }
    }
    tracing::debug!("Background tasks stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calibration::Phase;
    use crate::core::qos::QosOverride;

    #[test]
    fn test_second_phase_is_busy() {
        let agent = Agent::for_tests();
        let first = agent.dispatch(Command::CalibratePhase {
            phase: Phase::Review,
            duration_s: Some(3.0),
        });
        assert_eq!(first, vec![Event::sampling(Phase::Review)]);

        let second = agent.dispatch(Command::CalibratePhase {
            phase: Phase::Focus,
            duration_s: Some(3.0),
        });
        assert_eq!(
            second,
            vec![Event::calib_error(Some(Phase::Focus), &CalibrationError::Busy)]
        );
    }

    #[test]
    fn test_finalize_without_phases() {
        let agent = Agent::for_tests();
        let events = agent.dispatch(Command::CalibrateFinalize);
        assert_eq!(
            events,
            vec![Event::calib_error(None, &CalibrationError::MissingPhase)]
        );
    }

    #[test]
    fn test_conf_min_clamped() {
        let agent = Agent::for_tests();
        agent.dispatch(Command::SetConfMin { value: 3.0 });
        assert_eq!(agent.conf_min(), 1.0);

        let events = agent.dispatch(Command::SetConfMin { value: f64::NAN });
        assert!(matches!(&events[0], Event::Ack(ack) if !ack.ok));
        assert_eq!(agent.conf_min(), 1.0);

        let hb = agent.heartbeat(&agent.telemetry());
        assert_eq!(hb.conf_min, 1.0);
    }

    #[test]
    fn test_set_qos_reflected_in_perf() {
        let agent = Agent::for_tests();
        agent.dispatch(Command::SetQos(QosOverride {
            pose_stride: Some(3),
            target_fps: Some(5.0),
            ..QosOverride::default()
        }));
        let perf = agent.heartbeat(&agent.telemetry()).perf;
        assert_eq!(perf.pose_stride, 3);
        assert_eq!(perf.target_fps, 10.0);
    }

    #[test]
    fn test_camera_listing_and_switch() {
        let agent = Agent::for_tests();
        assert_eq!(
            agent.dispatch(Command::Cameras),
            vec![Event::Cameras {
                list: vec![0, 1],
                current: 0
            }]
        );

        let events = agent.dispatch(Command::SwitchCamera { index: 1 });
        assert!(matches!(&events[0], Event::Ack(ack) if ack.ok && ack.index == Some(1)));
        assert_eq!(agent.take_camera_request(), Some(1));
        assert_eq!(agent.take_camera_request(), None);

        let events = agent.dispatch(Command::SwitchCamera { index: 7 });
        assert!(matches!(&events[0], Event::Ack(ack) if !ack.ok && ack.reason == Some("open_failed")));
        assert_eq!(agent.take_camera_request(), None);
    }

    #[test]
    fn test_shutdown_acks_and_signals() {
        let agent = Agent::for_tests();
        let signal = agent.shutdown_signal();
        let events = agent.dispatch(Command::Shutdown);
        assert_eq!(events, vec![Event::Ack(Ack::ok("shutdown"))]);
        assert!(agent.is_shutdown());
        assert!(*signal.borrow());
    }
}
