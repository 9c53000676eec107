use std::{fs, path::Path};

use video_ingest::Frame;

use crate::source::{DetectionOutcome, PoseSource, PoseSourceError, parse_frame_line};

/// Plays back recorded detections keyed by the frame's source sequence number.
///
/// The on-disk form is JSON lines, one array of detections per frame. Frames
/// past the end of the recording yield nothing unless the replay loops.
#[derive(Clone, Debug, Default)]
pub struct ReplayPoseSource {
    frames: Vec<Vec<DetectionOutcome>>,
    looping: bool,
}

impl ReplayPoseSource {
    pub fn from_frames(frames: Vec<Vec<DetectionOutcome>>) -> Self {
        Self {
            frames,
            looping: false,
        }
    }

    pub fn open(path: &Path) -> Result<Self, PoseSourceError> {
        let contents = fs::read_to_string(path).map_err(|source| PoseSourceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let frames = contents
            .lines()
            .enumerate()
            .map(|(index, line)| {
                parse_frame_line(line).map_err(|source| PoseSourceError::Parse {
                    line: index + 1,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_frames(frames))
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl PoseSource for ReplayPoseSource {
    fn detect(&mut self, frame: &Frame) -> Vec<DetectionOutcome> {
        if self.frames.is_empty() {
            return Vec::new();
        }
        let mut index = frame.sequence as usize;
        if self.looping {
            index %= self.frames.len();
        }
        self.frames.get(index).cloned().unwrap_or_default()
    }

    fn describe(&self) -> String {
        format!("replay ({} frames)", self.frames.len())
    }
}
