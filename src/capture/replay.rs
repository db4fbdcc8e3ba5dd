//! JSON-lines sample source.
//!
//! An external detector process writes one [`FeatureSample`] object per line
//! (to our stdin or to a file). A reader thread parses lines and hands them to
//! the capture loop over a bounded channel, so a slow or stalled detector shows
//! up as failed acquisitions rather than a blocked pipeline.
//!
//! Detection strides and scale are the detector's job. When a control writer
//! is attached, the current [`QosSettings`] and camera go back to the detector
//! as one JSON line whenever they change:
//!
//! ```text
//! {"type":"settings","camera":0,"proc_scale":0.75,"fd_stride":2,"pose_stride":2,"target_fps":20.0}
//! ```

use crate::capture::types::{Acquisition, Clock, FeatureSample};
use crate::capture::{frame_budget, CaptureError, SampleSource};
use crate::core::qos::QosSettings;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

/// One parsed line from the detector stream.
#[derive(Debug)]
enum Line {
    Sample(FeatureSample),
    Malformed,
}

/// Control line sent back to the detector.
#[derive(Debug, Serialize)]
struct SettingsLine {
    #[serde(rename = "type")]
    kind: &'static str,
    camera: u32,
    #[serde(flatten)]
    settings: QosSettings,
}

/// Reads detector output as newline-delimited JSON.
pub struct JsonLinesSource {
    receiver: Receiver<Line>,
    clock: Clock,
    camera: u32,
    control: Option<Box<dyn Write + Send>>,
    last_sent: Option<(QosSettings, u32)>,
    child: Option<Child>,
}

impl JsonLinesSource {
    /// Start reading samples from `reader` on a background thread.
    pub fn spawn<R>(reader: R, camera: u32, clock: Clock) -> Self
    where
        R: BufRead + Send + 'static,
    {
        // Bounded so a fast file replay applies backpressure instead of
        // buffering the whole stream.
        let (sender, receiver) = bounded(256);

        thread::spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("Detector stream read failed: {}", e);
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let parsed = match serde_json::from_str::<FeatureSample>(trimmed) {
                    Ok(sample) => Line::Sample(sample),
                    Err(e) => {
                        tracing::debug!("Dropping malformed sample line: {}", e);
                        Line::Malformed
                    }
                };
                if sender.send(parsed).is_err() {
                    break;
                }
            }
            tracing::info!("Detector stream ended");
        });

        Self {
            receiver,
            clock,
            camera,
            control: None,
            last_sent: None,
            child: None,
        }
    }

    /// Send settings changes to the detector through `writer`.
    pub fn with_control<W>(mut self, writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.control = Some(Box::new(writer));
        self.last_sent = None;
        self
    }

    /// Run `command` as the detector: its stdout is the sample stream and
    /// its stdin receives settings lines. Arguments are split on whitespace.
    pub fn spawn_detector(command: &str, camera: u32, clock: Clock) -> Result<Self, CaptureError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or(CaptureError::EmptyCommand)?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.kill();
            return Err(CaptureError::Stream(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "detector pipes unavailable",
            )));
        };
        tracing::info!(program, pid = child.id(), "Detector started");

        let mut source = Self::spawn(io::BufReader::new(stdout), camera, clock).with_control(stdin);
        source.child = Some(child);
        Ok(source)
    }

    /// Replay samples from a file.
    pub fn from_path(path: &Path, camera: u32, clock: Clock) -> Result<Self, CaptureError> {
        let file = std::fs::File::open(path)?;
        Ok(Self::spawn(std::io::BufReader::new(file), camera, clock))
    }

    /// Read samples piped into our stdin.
    pub fn stdin(camera: u32, clock: Clock) -> Self {
        Self::spawn(std::io::BufReader::new(std::io::stdin()), camera, clock)
    }

    /// Write the settings line if settings or camera changed since the last
    /// one. A failed write detaches the control channel.
    fn push_settings(&mut self, settings: &QosSettings) {
        let Some(control) = self.control.as_mut() else {
            return;
        };
        let key = (*settings, self.camera);
        if self.last_sent == Some(key) {
            return;
        }

        let line = SettingsLine {
            kind: "settings",
            camera: self.camera,
            settings: *settings,
        };
        let written = serde_json::to_string(&line)
            .map_err(io::Error::from)
            .and_then(|json| {
                writeln!(control, "{json}")?;
                control.flush()
            });
        match written {
            Ok(()) => self.last_sent = Some(key),
            Err(e) => {
                tracing::warn!("Detector control channel closed: {}", e);
                self.control = None;
            }
        }
    }
}

impl Drop for JsonLinesSource {
    fn drop(&mut self) {
        self.control = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::info!("Detector stopped");
        }
    }
}

impl SampleSource for JsonLinesSource {
    fn next_sample(&mut self, settings: &QosSettings) -> Acquisition {
        self.push_settings(settings);
        let budget = frame_budget(settings);
        match self.receiver.recv_timeout(budget * 2) {
            Ok(Line::Sample(mut sample)) => {
                sample.timestamp_ms = self.clock.now_ms();
                Acquisition::Frame(sample)
            }
            Ok(Line::Malformed) | Err(RecvTimeoutError::Timeout) => Acquisition::Failed,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(budget);
                Acquisition::Failed
            }
        }
    }

    fn switch_camera(&mut self, index: u32) -> Result<(), CaptureError> {
        self.camera = index;
        Ok(())
    }

    fn current_camera(&self) -> u32 {
        self.camera
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Control writer the test can inspect afterwards.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn settings() -> QosSettings {
        QosSettings {
            proc_scale: 1.0,
            fd_stride: 1,
            pose_stride: 1,
            target_fps: 50.0,
        }
    }

    #[test]
    fn test_reads_samples_in_order() {
        let input = "{\"has_face\": true, \"eye_dist\": 0.1}\n\n{\"has_face\": true, \"eye_dist\": 0.2}\n";
        let mut source = JsonLinesSource::spawn(Cursor::new(input), 0, Clock::new());

        let first = source.next_sample(&settings());
        assert_eq!(first.sample().map(|s| s.eye_dist), Some(0.1));
        let second = source.next_sample(&settings());
        assert_eq!(second.sample().map(|s| s.eye_dist), Some(0.2));
    }

    #[test]
    fn test_malformed_line_is_failed_acquisition() {
        let input = "not json\n{\"has_pose\": true, \"nose_z\": -30.0}\n";
        let mut source = JsonLinesSource::spawn(Cursor::new(input), 0, Clock::new());

        assert_eq!(source.next_sample(&settings()), Acquisition::Failed);
        let next = source.next_sample(&settings());
        assert_eq!(next.sample().and_then(|s| s.nose_z), Some(-30.0));
    }

    #[test]
    fn test_end_of_stream_keeps_failing() {
        let mut source = JsonLinesSource::spawn(Cursor::new(""), 3, Clock::new());
        assert_eq!(source.next_sample(&settings()), Acquisition::Failed);
        assert_eq!(source.next_sample(&settings()), Acquisition::Failed);
        assert_eq!(source.current_camera(), 3);
    }

    #[test]
    fn test_settings_sent_on_change_only() {
        let input = "{}\n{}\n{}\n{}\n";
        let control = Captured::default();
        let mut source =
            JsonLinesSource::spawn(Cursor::new(input), 0, Clock::new()).with_control(control.clone());

        source.next_sample(&settings());
        source.next_sample(&settings());
        assert_eq!(control.lines().len(), 1);
        assert_eq!(
            control.lines()[0],
            serde_json::json!({
                "type": "settings", "camera": 0, "proc_scale": 1.0,
                "fd_stride": 1, "pose_stride": 1, "target_fps": 50.0
            })
        );

        let stepped = QosSettings {
            pose_stride: 2,
            ..settings()
        };
        source.next_sample(&stepped);
        source.switch_camera(1).unwrap();
        source.next_sample(&stepped);

        let lines = control.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["pose_stride"], 2);
        assert_eq!(lines[2]["camera"], 1);
    }

    #[test]
    fn test_samples_pass_through_unchanged_under_strides() {
        let input = "{\"has_pose\": true, \"nose_z\": -25.0}\n\
                     {\"has_pose\": true, \"nose_z\": -35.0}\n\
                     {\"has_pose\": true, \"nose_z\": -35.0}\n";
        let mut source = JsonLinesSource::spawn(Cursor::new(input), 0, Clock::new())
            .with_control(Captured::default());
        let strided = QosSettings {
            fd_stride: 3,
            pose_stride: 3,
            ..settings()
        };

        let depths: Vec<_> = (0..3)
            .map(|_| source.next_sample(&strided).sample().and_then(|s| s.nose_z))
            .collect();
        assert_eq!(depths, vec![Some(-25.0), Some(-35.0), Some(-35.0)]);
    }

    #[test]
    fn test_broken_control_channel_is_dropped() {
        let input = "{\"has_face\": true, \"eye_dist\": 0.1}\n";
        let mut source =
            JsonLinesSource::spawn(Cursor::new(input), 0, Clock::new()).with_control(Closed);

        let first = source.next_sample(&settings());
        assert_eq!(first.sample().map(|s| s.eye_dist), Some(0.1));
        assert!(source.control.is_none());
    }

    #[test]
    fn test_empty_detector_command_rejected() {
        let result = JsonLinesSource::spawn_detector("   ", 0, Clock::new());
        assert!(matches!(result, Err(CaptureError::EmptyCommand)));
    }

    #[cfg(unix)]
    #[test]
    fn test_detector_process_receives_settings() {
        // `cat` echoes the settings line back as its only output line.
        let mut source = JsonLinesSource::spawn_detector("cat", 0, Clock::new()).unwrap();
        let slow = QosSettings {
            target_fps: 1.0,
            ..settings()
        };
        assert!(source.next_sample(&slow).is_ok());
        drop(source);
    }
}
