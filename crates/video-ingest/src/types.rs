use std::borrow::Cow;

use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    /// Sequence number assigned by the source, starting at zero.
    pub sequence: u64,
    /// Capture wall-clock time in Unix milliseconds.
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Gray8,
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Gray8 => 1,
            FrameFormat::Bgr8 => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameFormat::Gray8 => "gray8",
            FrameFormat::Bgr8 => "bgr8",
        }
    }
}

impl Frame {
    /// Uniform single-channel frame, mostly useful for tests and synthetic feeds.
    pub fn gray(width: i32, height: i32, value: u8) -> Self {
        let pixels = (width.max(0) as usize) * (height.max(0) as usize);
        Self {
            data: vec![value; pixels],
            width,
            height,
            sequence: 0,
            timestamp_ms: 0,
            format: FrameFormat::Gray8,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn pixel_count(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize)
    }

    /// Luminance plane of the frame.
    ///
    /// Gray frames are borrowed as-is; BGR frames are converted with integer
    /// BT.601 weights.
    pub fn luma(&self) -> Cow<'_, [u8]> {
        match self.format {
            FrameFormat::Gray8 => Cow::Borrowed(&self.data),
            FrameFormat::Bgr8 => Cow::Owned(
                self.data
                    .chunks_exact(3)
                    .map(|px| {
                        let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
                        ((29 * b + 150 * g + 77 * r) >> 8) as u8
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source reached end of stream")]
    EndOfStream,
    #[error(transparent)]
    Other(#[from] Error),
}

/// Pull-style frame producer.
pub trait VideoSource: Send {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Human readable identifier used in logs.
    fn describe(&self) -> String {
        "video source".to_string()
    }
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
