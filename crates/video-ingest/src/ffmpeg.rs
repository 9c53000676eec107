//! Capture through an `ffmpeg` child process emitting raw BGR frames on stdout.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::debug;

use crate::{
    camera::parse_device_index,
    types::{CaptureError, Frame, FrameFormat, VideoSource},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L device, by index or `/dev/videoN` path.
    Device,
    /// Real-time streaming protocol feed.
    Rtsp,
    /// Anything else ffmpeg can open, typically a recorded file.
    File,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if parse_device_index(uri).is_some() {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }
}

/// Frame source backed by an `ffmpeg` subprocess.
///
/// Frames are scaled to the requested size by ffmpeg itself, so every read is
/// exactly `width * height * 3` bytes. The child is killed when the source is
/// dropped.
pub struct FfmpegSource {
    uri: String,
    child: Child,
    stdout: ChildStdout,
    width: i32,
    height: i32,
    buffer: Vec<u8>,
    sequence: u64,
}

impl FfmpegSource {
    pub fn spawn(uri: &str, target_size: (i32, i32), fps: Option<u32>) -> Result<Self, CaptureError> {
        let (width, height) = target_size;
        if width <= 0 || height <= 0 {
            return Err(CaptureError::Other(anyhow!(
                "frame size must be positive, got {width}x{height}"
            )));
        }

        let cmd = build_command(uri, target_size, fps);
        debug!("Spawning ffmpeg for {uri}: {cmd:?}");
        let mut child = spawn_child(cmd).map_err(|err| {
            debug!("ffmpeg failed to start for {uri}: {err}");
            CaptureError::Open {
                uri: uri.to_string(),
            }
        })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                return Err(CaptureError::Other(anyhow!(
                    "failed to capture ffmpeg stdout"
                )));
            }
        };

        let frame_bytes = (width as usize) * (height as usize) * FrameFormat::Bgr8.bytes_per_pixel();
        Ok(Self {
            uri: uri.to_string(),
            child,
            stdout,
            width,
            height,
            buffer: vec![0u8; frame_bytes],
            sequence: 0,
        })
    }
}

fn spawn_child(mut cmd: Command) -> std::io::Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
}

fn build_command(uri: &str, target_size: (i32, i32), fps: Option<u32>) -> Command {
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    let input = match SourceKind::from_uri(uri) {
        SourceKind::Device => {
            cmd.arg("-f").arg("video4linux2");
            if let Some(fps) = fps {
                cmd.arg("-framerate").arg(fps.to_string());
            }
            match parse_device_index(uri) {
                Some(index) => format!("/dev/video{index}"),
                None => uri.to_string(),
            }
        }
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-max_delay")
                .arg("0");
            uri.to_string()
        }
        SourceKind::File => {
            cmd.arg("-re");
            uri.to_string()
        }
    };

    cmd.arg("-i")
        .arg(input)
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}

impl VideoSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.stdout.read_exact(&mut self.buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: self.buffer.clone(),
                    width: self.width,
                    height: self.height,
                    sequence: self.sequence,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                };
                self.sequence += 1;
                Ok(frame)
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::EndOfStream),
            Err(err) => Err(CaptureError::Other(err.into())),
        }
    }

    fn describe(&self) -> String {
        format!("ffmpeg {} ({}x{})", self.uri, self.width, self.height)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
