//! Adaptive quality of service.
//!
//! A discrete, hysteretic control loop: once per tick the rolling mean frame
//! time is compared with the frame budget and detector work is stepped down
//! or back up by exactly one notch.

use crate::config::QosConfig;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use sysinfo::System;

/// How much detector work the capture stage does per frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosSettings {
    /// Fraction of the camera resolution handed to the detector
    pub proc_scale: f64,
    /// Run face detection every n-th frame
    pub fd_stride: u32,
    /// Run pose estimation every n-th frame
    pub pose_stride: u32,
    pub target_fps: f64,
}

/// Client-requested overrides from `set_qos`. Absent fields are unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QosOverride {
    #[serde(default)]
    pub proc_scale: Option<f64>,
    #[serde(default)]
    pub fd_stride: Option<u32>,
    #[serde(default)]
    pub pose_stride: Option<u32>,
    #[serde(default)]
    pub target_fps: Option<f64>,
}

/// Performance block of the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerfReport {
    pub avg_ms: f64,
    pub target_fps: f64,
    pub proc_scale: f64,
    pub fd_stride: u32,
    pub pose_stride: u32,
    pub cpu_pct: Option<f64>,
    pub overload: bool,
    pub hb_interval_ms: u64,
}

/// One notch applied by a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QosStep {
    PoseStride(u32),
    FdStride(u32),
    ProcScale(f64),
}

impl fmt::Display for QosStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QosStep::PoseStride(v) => write!(f, "pose_stride={v}"),
            QosStep::FdStride(v) => write!(f, "fd_stride={v}"),
            QosStep::ProcScale(v) => write!(f, "proc_scale={v:.2}"),
        }
    }
}

/// Rolling frame-time window plus the current settings.
#[derive(Debug, Clone)]
pub struct QosController {
    config: QosConfig,
    settings: QosSettings,
    frame_times: VecDeque<f64>,
    cpu_pct: Option<f64>,
    overloaded: bool,
    comfortable_ticks: u32,
}

impl QosController {
    pub fn new(mut config: QosConfig) -> Self {
        config.sanitize();
        let mut controller = Self {
            settings: QosSettings {
                proc_scale: config.proc_scale,
                fd_stride: config.fd_stride,
                pose_stride: config.pose_stride,
                target_fps: config.target_fps,
            },
            frame_times: VecDeque::with_capacity(config.rolling_samples.max(1)),
            cpu_pct: None,
            overloaded: false,
            comfortable_ticks: 0,
            config,
        };
        controller.settings = controller.clamp(controller.settings);
        controller
    }

    pub fn settings(&self) -> QosSettings {
        self.settings
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded
    }

    /// Record the processing time of one frame.
    pub fn record_frame(&mut self, processing_ms: f64) {
        if !processing_ms.is_finite() || processing_ms < 0.0 {
            return;
        }
        if self.frame_times.len() >= self.config.rolling_samples.max(1) {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(processing_ms);
    }

    /// Mean of the rolling window, 0 before the first frame.
    pub fn avg_processing_ms(&self) -> f64 {
        if self.frame_times.is_empty() {
            0.0
        } else {
            self.frame_times.iter().mean()
        }
    }

    pub fn frame_budget_ms(&self) -> f64 {
        1000.0 / self.settings.target_fps
    }

    /// Run one control tick. Returns the notch applied, if any.
    pub fn tick(&mut self, cpu_pct: Option<f64>) -> Option<QosStep> {
        self.cpu_pct = cpu_pct.filter(|c| c.is_finite());

        let avg = self.avg_processing_ms();
        let budget = self.frame_budget_ms();
        let cpu_hot = self
            .cpu_pct
            .is_some_and(|c| c >= self.config.cpu_overload_pct);
        self.overloaded = avg > budget * self.config.overload_high || cpu_hot;

        let step = if self.overloaded {
            self.comfortable_ticks = 0;
            self.step_down()
        } else if !self.frame_times.is_empty() && avg < budget * self.config.overload_clear {
            self.comfortable_ticks += 1;
            if self.comfortable_ticks >= self.config.recover_ticks.max(1) {
                self.step_up()
            } else {
                None
            }
        } else {
            self.comfortable_ticks = 0;
            None
        };

        if let Some(step) = step {
            tracing::debug!(
                avg_ms = avg,
                budget_ms = budget,
                cpu = ?self.cpu_pct,
                "QoS adjusted {}",
                step
            );
        }
        step
    }

    /// Apply client overrides, clamped to the configured bounds.
    pub fn apply_override(&mut self, update: &QosOverride) -> QosSettings {
        let mut next = self.settings;
        if let Some(v) = update.proc_scale.filter(|v| v.is_finite()) {
            next.proc_scale = v;
        }
        if let Some(v) = update.fd_stride {
            next.fd_stride = v;
        }
        if let Some(v) = update.pose_stride {
            next.pose_stride = v;
        }
        if let Some(v) = update.target_fps.filter(|v| v.is_finite()) {
            next.target_fps = v;
        }
        self.settings = self.clamp(next);
        self.comfortable_ticks = 0;
        self.settings
    }

    pub fn heartbeat_interval(&self) -> Duration {
        if self.overloaded {
            Duration::from_millis(self.config.heartbeat_overload_ms)
        } else {
            Duration::from_millis(self.config.heartbeat_ms)
        }
    }

    pub fn perf(&self) -> PerfReport {
        PerfReport {
            avg_ms: round_to(self.avg_processing_ms(), 1),
            target_fps: self.settings.target_fps,
            proc_scale: round_to(self.settings.proc_scale, 2),
            fd_stride: self.settings.fd_stride,
            pose_stride: self.settings.pose_stride,
            cpu_pct: self.cpu_pct.map(|c| round_to(c, 1)),
            overload: self.overloaded,
            hb_interval_ms: self.heartbeat_interval().as_millis() as u64,
        }
    }

    fn step_down(&mut self) -> Option<QosStep> {
        let cfg = &self.config;
        let s = &mut self.settings;
        if s.pose_stride < cfg.pose_stride_max {
            s.pose_stride += 1;
            Some(QosStep::PoseStride(s.pose_stride))
        } else if s.fd_stride < cfg.fd_stride_max {
            s.fd_stride += 1;
            Some(QosStep::FdStride(s.fd_stride))
        } else if s.proc_scale > cfg.proc_scale_min {
            s.proc_scale = (s.proc_scale - cfg.proc_scale_step_down).max(cfg.proc_scale_min);
            Some(QosStep::ProcScale(s.proc_scale))
        } else {
            None
        }
    }

    fn step_up(&mut self) -> Option<QosStep> {
        let cfg = &self.config;
        let s = &mut self.settings;
        if s.proc_scale < cfg.proc_scale_max {
            s.proc_scale = (s.proc_scale + cfg.proc_scale_step_up).min(cfg.proc_scale_max);
            Some(QosStep::ProcScale(s.proc_scale))
        } else if s.fd_stride > 1 {
            s.fd_stride -= 1;
            Some(QosStep::FdStride(s.fd_stride))
        } else if s.pose_stride > 1 {
            s.pose_stride -= 1;
            Some(QosStep::PoseStride(s.pose_stride))
        } else {
            None
        }
    }

    fn clamp(&self, s: QosSettings) -> QosSettings {
        let cfg = &self.config;
        let target_fps = if s.target_fps.is_finite() {
            s.target_fps.clamp(cfg.fps_min, cfg.fps_max)
        } else {
            cfg.target_fps.clamp(cfg.fps_min, cfg.fps_max)
        };
        QosSettings {
            proc_scale: s.proc_scale.clamp(cfg.proc_scale_min, cfg.proc_scale_max),
            fd_stride: s.fd_stride.clamp(1, cfg.fd_stride_max.max(1)),
            pose_stride: s.pose_stride.clamp(1, cfg.pose_stride_max.max(1)),
            target_fps,
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Host-wide CPU usage via `sysinfo`.
pub struct CpuSampler {
    system: System,
}

impl fmt::Debug for CpuSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuSampler").finish_non_exhaustive()
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler {
    /// Usage is measured between refreshes, so the first sample primes the
    /// counters.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system }
    }

    pub fn sample(&mut self) -> Option<f64> {
        self.system.refresh_cpu_all();
        let pct = f64::from(self.system.global_cpu_usage());
        pct.is_finite().then_some(pct)
    }
}
