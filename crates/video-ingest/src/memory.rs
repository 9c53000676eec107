use std::collections::VecDeque;

use crate::types::{CaptureError, Frame, VideoSource};

/// Replays a fixed list of frames, then reports end of stream.
#[derive(Default)]
pub struct MemorySource {
    frames: VecDeque<Frame>,
    delivered: u64,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            delivered: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl VideoSource for MemorySource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let frame = self.frames.pop_front().ok_or(CaptureError::EndOfStream)?;
        self.delivered += 1;
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!(
            "memory ({} delivered, {} queued)",
            self.delivered,
            self.frames.len()
        )
    }
}
