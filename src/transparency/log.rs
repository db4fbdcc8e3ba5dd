//! Privacy-preserving transparency log.
//!
//! Counts what the agent processed without recording any of it: no frames,
//! no landmarks, no per-sample values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current session, optionally persisted across runs.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Feature samples that went through the pipeline
    frames_processed: AtomicU64,
    /// Acquisitions that produced no usable frame
    frames_failed: AtomicU64,
    /// Committed FOCUS/REVIEW changes
    state_changes: AtomicU64,
    /// Calibration profiles written to disk
    calibrations_saved: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
            calibrations_saved: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that resumes from, and saves to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("Could not load previous transparency stats: {}", e);
        }

        log
    }

    pub fn record_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_frame(&self) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_state_change(&self) {
        self.state_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_calibration_saved(&self) {
        self.calibrations_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            calibrations_saved: self.calibrations_saved.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the `status` command.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Frames processed: {}\n\
             - Failed acquisitions: {}\n\
             - Mode changes: {}\n\
             - Calibrations saved: {}\n\
             - Session duration: {} seconds\n\
             \n\
             Privacy Guarantee:\n\
             - No camera frames stored or transmitted\n\
             - No landmark coordinates retained\n\
             - Only aggregate counters persisted",
            stats.frames_processed,
            stats.frames_failed,
            stats.state_changes,
            stats.calibrations_saved,
            stats.session_duration_secs
        )
    }

    /// Save counters to disk, if persistence is enabled.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                frames_processed: stats.frames_processed,
                frames_failed: stats.frames_failed,
                state_changes: stats.state_changes,
                calibrations_saved: stats.calibrations_saved,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.frames_processed
                    .store(persisted.frames_processed, Ordering::Relaxed);
                self.frames_failed
                    .store(persisted.frames_failed, Ordering::Relaxed);
                self.state_changes
                    .store(persisted.state_changes, Ordering::Relaxed);
                self.calibrations_saved
                    .store(persisted.calibrations_saved, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub state_changes: u64,
    pub calibrations_saved: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    frames_processed: u64,
    frames_failed: u64,
    state_changes: u64,
    calibrations_saved: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;
