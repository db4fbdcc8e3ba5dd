//! Wire protocol spoken over the WebSocket.
//!
//! Inbound messages are JSON objects tagged by `cmd`, outbound ones by
//! `type`. Both sides are closed enums; anything that does not decode into a
//! [`Command`] is answered with a single `error` event.

use crate::capture::types::FeatureSample;
use crate::core::calibration::{CalibrationError, Phase, PhaseOutcome, PhaseResult};
use crate::core::fuser::FusedMetric;
use crate::core::health::HealthStatus;
use crate::core::mode::{ModeState, TransitionInfo};
use crate::core::profile::CalibrationProfile;
use crate::core::qos::{PerfReport, QosOverride, QosSettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version carried by `state` events.
pub const PROTOCOL_VERSION: u32 = 6;

/// A client request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    CalibratePhase {
        phase: Phase,
        #[serde(default)]
        duration_s: Option<f64>,
    },
    CalibrateFinalize,
    SetConfMin {
        value: f64,
    },
    SetQos(QosOverride),
    Cameras,
    SwitchCamera {
        index: u32,
    },
    Shutdown,
}

impl Command {
    /// Every recognised `cmd` value.
    pub const NAMES: [&'static str; 7] = [
        "calibrate_phase",
        "calibrate_finalize",
        "set_conf_min",
        "set_qos",
        "cameras",
        "switch_camera",
        "shutdown",
    ];

    /// Decode one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let name = value
            .get("cmd")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ProtocolError::Malformed("missing string field `cmd`".to_string()))?;
        if !Self::NAMES.contains(&name) {
            return Err(ProtocolError::UnknownCommand(name.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Why an inbound message was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("malformed command: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnknownCommand(_) => "unknown_command",
            ProtocolError::Malformed(_) => "malformed_command",
        }
    }
}

/// Progress of a calibration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibStatus {
    Sampling,
    Error,
}

/// Periodic telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    pub fps: f64,
    /// Raw pose depth of the latest frame, when pose was found
    pub metric_nose_z_x100: Option<f64>,
    pub confidence: f64,
    pub conf_min: f64,
    pub paused: bool,
    pub features: Option<FeatureSample>,
    pub fused: FusedMetric,
    pub health: HealthStatus,
    pub perf: PerfReport,
    pub transition: TransitionInfo,
}

/// Acknowledgement of a command that has no richer reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub what: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl Ack {
    pub fn ok(what: &'static str) -> Self {
        Self {
            what,
            ok: true,
            value: None,
            qos: None,
            index: None,
            reason: None,
        }
    }
}

/// A server message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    State {
        v: u32,
        state: ModeState,
        paused: bool,
    },
    Hb(Box<Heartbeat>),
    CalibStatus {
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<Phase>,
        status: CalibStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    CalibResultPhase(PhaseResult),
    CalibDone {
        saved: CalibrationProfile,
    },
    Cameras {
        list: Vec<u32>,
        current: u32,
    },
    Ack(Ack),
    Error {
        code: &'static str,
        message: String,
    },
}

impl Event {
    pub fn state(state: ModeState, paused: bool) -> Self {
        Event::State {
            v: PROTOCOL_VERSION,
            state,
            paused,
        }
    }

    pub fn sampling(phase: Phase) -> Self {
        Event::CalibStatus {
            phase: Some(phase),
            status: CalibStatus::Sampling,
            reason: None,
        }
    }

    pub fn calib_error(phase: Option<Phase>, error: &CalibrationError) -> Self {
        Event::CalibStatus {
            phase,
            status: CalibStatus::Error,
            reason: Some(error.reason()),
        }
    }

    pub fn protocol_error(error: &ProtocolError) -> Self {
        Event::Error {
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<PhaseOutcome> for Event {
    fn from(outcome: PhaseOutcome) -> Self {
        match outcome {
            PhaseOutcome::Completed(result) => Event::CalibResultPhase(result),
            PhaseOutcome::Failed { phase, error } => Event::calib_error(Some(phase), &error),
        }
    }
}
