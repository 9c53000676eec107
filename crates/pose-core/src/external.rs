//! Detector running as a child process.
//!
//! For each frame the adapter writes one JSON header line followed by the raw
//! pixel bytes to the child's stdin, then reads one line of detections back
//! from its stdout in the same format the replay files use.

use std::{
    io::{BufRead, BufReader, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use serde::Serialize;
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::source::{
    DetectionFailure, DetectionOutcome, PoseSource, PoseSourceError, parse_frame_line,
};

#[derive(Serialize)]
struct FrameHeader<'a> {
    sequence: u64,
    timestamp_ms: i64,
    width: i32,
    height: i32,
    format: &'a str,
    bytes: usize,
}

pub struct ExternalPoseSource {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl ExternalPoseSource {
    /// Start `command_line` (program followed by whitespace separated arguments).
    pub fn spawn(command_line: &str) -> Result<Self, PoseSourceError> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or(PoseSourceError::EmptyCommand)?;
        let spawn_error = |source| PoseSourceError::Spawn {
            command: command_line.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(spawn_error(std::io::Error::other(
                "detector pipes unavailable",
            )));
        };
        debug!("Started detector process `{command_line}` (pid {})", child.id());

        Ok(Self {
            command: command_line.to_string(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            line: String::new(),
        })
    }

    fn exchange(&mut self, frame: &Frame) -> Result<Vec<DetectionOutcome>, String> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| "detector input closed".to_string())?;
        let header = FrameHeader {
            sequence: frame.sequence,
            timestamp_ms: frame.timestamp_ms,
            width: frame.width,
            height: frame.height,
            format: frame.format.label(),
            bytes: frame.data.len(),
        };
        let mut payload = serde_json::to_vec(&header).map_err(|err| err.to_string())?;
        payload.push(b'\n');

        let written = stdin
            .write_all(&payload)
            .and_then(|()| stdin.write_all(&frame.data))
            .and_then(|()| stdin.flush());
        if let Err(err) = written {
            self.stdin = None;
            return Err(format!("failed to send frame to detector: {err}"));
        }

        self.line.clear();
        match self.stdout.read_line(&mut self.line) {
            Ok(0) => {
                self.stdin = None;
                Err("detector exited".to_string())
            }
            Ok(_) => parse_frame_line(&self.line)
                .map_err(|err| format!("detector replied with malformed detections: {err}")),
            Err(err) => Err(format!("failed to read detector reply: {err}")),
        }
    }
}

impl PoseSource for ExternalPoseSource {
    fn detect(&mut self, frame: &Frame) -> Vec<DetectionOutcome> {
        match self.exchange(frame) {
            Ok(outcomes) => outcomes,
            Err(reason) => vec![Err(DetectionFailure::frame(reason))],
        }
    }

    fn describe(&self) -> String {
        format!("external `{}`", self.command)
    }
}

impl Drop for ExternalPoseSource {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Err(err) = self.child.kill() {
            warn!("Failed to stop detector `{}`: {err}", self.command);
        }
        let _ = self.child.wait();
    }
}
