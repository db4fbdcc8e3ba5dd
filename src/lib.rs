//! Focus Sensor Agent - camera-posture attention sensor.
//!
//! This library turns per-frame landmark features (produced by an external
//! face/pose detector) into a debounced FOCUS/REVIEW attention signal for a
//! single editor client, while keeping detector work within a CPU budget.
//!
//! # Privacy Guarantees
//!
//! - **No pixels**: The agent only ever sees landmark geometry and image
//!   quality statistics
//! - **No raw storage**: Feature samples are discarded after each frame
//! - **Local only**: The WebSocket listens on localhost
//! - **Transparency**: Processing counters are logged and auditable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Focus Sensor Agent                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐  │
//! │  │ Capture  │──▶│  Health  │──▶│  Fuser   │──▶│   Mode   │  │
//! │  │ (source) │   │ monitor  │   │  (EMA)   │   │ machine  │  │
//! │  └──────────┘   └──────────┘   └──────────┘   └──────────┘  │
//! │       ▲                              │              │        │
//! │       │ strides/scale                ▼              ▼        │
//! │  ┌──────────┐                 ┌──────────┐   ┌──────────┐   │
//! │  │   QoS    │                 │Calibration│  │ WebSocket│   │
//! │  │controller│                 │  store    │  │  server  │   │
//! │  └──────────┘                 └──────────┘   └──────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use focus_sensor_agent::capture::{Acquisition, FeatureSample};
//! use focus_sensor_agent::config::Config;
//! use focus_sensor_agent::core::{ModeMachine, SignalFuser};
//!
//! let config = Config::default();
//! let mut fuser = SignalFuser::new(config.fusion.clone());
//! let mut machine = ModeMachine::new(config.mode.min_flip_gap_ms);
//! let thresholds = focus_sensor_agent::core::CalibrationProfile::from_defaults(&config.mode)
//!     .thresholds();
//!
//! let mut sample = FeatureSample::empty(0);
//! sample.has_pose = true;
//! sample.nose_z = Some(-33.0);
//! let fused = fuser.fuse(&sample);
//! let state = machine.update(fused.ema, sample.timestamp_ms, &thresholds, false);
//! println!("{state:?}");
//! # let _ = Acquisition::Failed;
//! ```

pub mod agent;
pub mod capture;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod transparency;

// Re-export key types at crate root for convenience
pub use agent::Agent;
pub use capture::{Acquisition, FeatureSample, SampleSource};
pub use config::Config;
pub use core::{CalibrationProfile, ModeState};
pub use pipeline::{FramePipeline, Telemetry};
pub use protocol::{Command, Event};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║             FOCUS SENSOR AGENT - PRIVACY DECLARATION             ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This agent estimates whether you are leaning in (FOCUS) or      ║
║  sitting back (REVIEW) from your camera.                         ║
║                                                                  ║
║  ✓ WHAT WE PROCESS:                                              ║
║    • Face and pose landmark geometry (distances, angles)         ║
║    • Image brightness and sharpness figures                      ║
║                                                                  ║
║  ✗ WHAT WE NEVER DO:                                             ║
║    • Store or transmit camera frames                             ║
║    • Recognise or identify faces                                 ║
║    • Keep per-frame measurements after processing                ║
║    • Accept connections from other machines                      ║
║                                                                  ║
║  Only your calibration profile (two posture averages and the     ║
║  derived thresholds) and aggregate counters are saved.           ║
║                                                                  ║
║  You can view processing statistics anytime with:                ║
║    focus-sensor status                                           ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
