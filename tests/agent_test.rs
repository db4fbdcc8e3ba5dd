//! Integration tests for command dispatch and calibration persistence

use focus_sensor_agent::capture::{Acquisition, FeatureSample, StaticCameras};
use focus_sensor_agent::config::Config;
use focus_sensor_agent::core::{
    CalibrationError, CalibrationProfile, JsonProfileStore, Phase, ProfileStore,
};
use focus_sensor_agent::pipeline::FramePipeline;
use focus_sensor_agent::protocol::{Command, Event};
use focus_sensor_agent::{Agent, TransparencyLog};
use std::path::Path;
use std::sync::Arc;

fn agent_with_store(path: &Path) -> Agent {
    Agent::new(
        Config::default(),
        Box::new(JsonProfileStore::new(path)),
        Box::new(StaticCameras::new(vec![0, 1])),
        Arc::new(TransparencyLog::new()),
    )
}

/// A frame with both face and pose; pose depth decides the fused value.
fn posture(nose_z: f64) -> Acquisition {
    let mut s = FeatureSample::empty(0);
    s.has_face = true;
    s.eye_dist = 0.12;
    s.bbox_area = 0.08;
    s.has_pose = true;
    s.nose_z = Some(nose_z);
    Acquisition::Frame(s)
}

/// Sample one phase for one second starting at `start_ms`, 20 frames.
fn run_phase(agent: &Agent, pipeline: &mut FramePipeline, phase: Phase, nose_z: f64, start_ms: u64) {
    agent
        .with_calibration(|c| c.begin_phase(phase, Some(1.0), start_ms))
        .unwrap();
    for i in 1..=20 {
        pipeline.process(agent, &posture(nose_z), start_ms + i * 50);
    }
    assert_eq!(agent.with_calibration(|c| c.active_phase()), None);
}

fn stored_profile() -> CalibrationProfile {
    CalibrationProfile {
        threshold_low: 0.3,
        threshold_high: 0.7,
        ..CalibrationProfile::from_defaults(&Config::default().mode)
    }
}

#[test]
fn test_full_calibration_saves_and_applies_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let agent = agent_with_store(&path);
    let mut pipeline = FramePipeline::new(agent.config());
    let mut events = agent.subscribe();

    run_phase(&agent, &mut pipeline, Phase::Review, -26.5, 0);
    run_phase(&agent, &mut pipeline, Phase::Focus, -32.5, 2000);

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::CalibResultPhase(result) = event {
            phases.push(result.phase);
        }
    }
    assert_eq!(phases, vec![Phase::Review, Phase::Focus]);

    let replies = agent.dispatch(Command::CalibrateFinalize);
    let saved = match &replies[..] {
        [Event::CalibDone { saved }] => saved.clone(),
        other => panic!("unexpected replies {other:?}"),
    };
    assert!(saved.threshold_low < 0.5 && 0.5 < saved.threshold_high);
    assert!(saved.is_calibrated());

    let reloaded = JsonProfileStore::new(&path).load().unwrap().unwrap();
    assert_eq!(reloaded, saved);
    assert_eq!(agent.thresholds(), saved.thresholds());
    assert_eq!(agent.transparency().stats().calibrations_saved, 1);
}

#[test]
fn test_finalize_with_only_review_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    JsonProfileStore::new(&path).save(&stored_profile()).unwrap();
    let before = std::fs::read(&path).unwrap();

    let agent = agent_with_store(&path);
    assert_eq!(agent.profile(), stored_profile());
    let mut pipeline = FramePipeline::new(agent.config());
    run_phase(&agent, &mut pipeline, Phase::Review, -26.5, 0);

    let replies = agent.dispatch(Command::CalibrateFinalize);
    assert_eq!(
        replies,
        vec![Event::calib_error(None, &CalibrationError::MissingPhase)]
    );
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(agent.profile(), stored_profile());
}

#[test]
fn test_reversed_postures_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let agent = agent_with_store(&path);
    let mut pipeline = FramePipeline::new(agent.config());

    // FOCUS sampled sitting further back than REVIEW
    run_phase(&agent, &mut pipeline, Phase::Review, -32.5, 0);
    run_phase(&agent, &mut pipeline, Phase::Focus, -26.5, 2000);

    let replies = agent.dispatch(Command::CalibrateFinalize);
    assert_eq!(
        replies,
        vec![Event::calib_error(None, &CalibrationError::InvalidOrdering)]
    );
    assert!(!path.exists());
    assert!(!agent.profile().is_calibrated());
}

#[test]
fn test_persist_failure_still_applies_profile() {
    let dir = tempfile::tempdir().unwrap();
    // The store's parent directory is a regular file, so saving fails.
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let agent = agent_with_store(&blocker.join("calibration.json"));
    let mut pipeline = FramePipeline::new(agent.config());

    run_phase(&agent, &mut pipeline, Phase::Review, -26.5, 0);
    run_phase(&agent, &mut pipeline, Phase::Focus, -32.5, 2000);

    let replies = agent.dispatch(Command::CalibrateFinalize);
    match &replies[..] {
        [Event::CalibStatus { reason, .. }] => assert_eq!(*reason, Some("persist_failed")),
        other => panic!("unexpected replies {other:?}"),
    }
    assert!(agent.profile().is_calibrated());
    assert_eq!(agent.transparency().stats().calibrations_saved, 0);
}

#[test]
fn test_corrupt_profile_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    std::fs::write(&path, "{ not json").unwrap();

    let agent = agent_with_store(&path);
    assert_eq!(
        agent.profile(),
        CalibrationProfile::from_defaults(&agent.config().mode)
    );
}

#[test]
fn test_phase_without_frames_reports_insufficient_samples() {
    let dir = tempfile::tempdir().unwrap();
    let agent = agent_with_store(&dir.path().join("calibration.json"));
    let mut pipeline = FramePipeline::new(agent.config());
    let mut events = agent.subscribe();

    agent
        .with_calibration(|c| c.begin_phase(Phase::Review, Some(1.0), 0))
        .unwrap();
    for i in 1..=25 {
        pipeline.process(&agent, &Acquisition::Failed, i * 50);
    }

    let event = events.try_recv().unwrap();
    assert_eq!(
        event,
        Event::calib_error(
            Some(Phase::Review),
            &CalibrationError::InsufficientSamples { n: 0, required: 10 }
        )
    );
}
