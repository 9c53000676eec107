//! Local capture device discovery.

use std::path::{Path, PathBuf};

/// A V4L capture node found under `/dev`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoDevice {
    pub index: i32,
    pub path: PathBuf,
}

/// Probe `/dev/video0`, `/dev/video1`, ... and stop at the first index that is missing.
pub fn list_video_devices() -> Vec<VideoDevice> {
    list_video_devices_in(Path::new("/dev"))
}

pub(crate) fn list_video_devices_in(root: &Path) -> Vec<VideoDevice> {
    let mut devices = Vec::new();
    for index in 0.. {
        let path = root.join(format!("video{index}"));
        if !path.exists() {
            break;
        }
        devices.push(VideoDevice { index, path });
    }
    devices
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let digits = uri.strip_prefix("/dev/video")?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.parse::<i32>().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_indices_and_device_paths() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video3"), Some(3));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }

    #[test]
    fn listing_stops_at_first_gap() {
        let dir = std::env::temp_dir().join(format!("video-ingest-probe-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["video0", "video1", "video3"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        let found = list_video_devices_in(&dir);
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(
            found.iter().map(|d| d.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }
}
