//! Frame acquisition backends used by the tracker.
//!
//! Every backend implements [`VideoSource`], a pull-style interface the
//! acquisition stage calls once per frame. [`CaptureError::EndOfStream`]
//! marks a source that has nothing more to give.

pub mod camera;
pub mod ffmpeg;
pub mod memory;
pub mod types;

pub use camera::{VideoDevice, list_video_devices, parse_device_index};
pub use ffmpeg::{FfmpegSource, SourceKind};
pub use memory::MemorySource;
pub use types::{CaptureError, Frame, FrameFormat, VideoSource};
