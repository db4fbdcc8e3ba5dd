//! Transparency module for the Focus Sensor Agent.
//!
//! Tracks what the agent processed so users can audit it without any
//! captured content being kept.

pub mod log;

pub use log::{SharedTransparencyLog, TransparencyLog, TransparencyStats};
