//! Frame acquisition with motion-adaptive skipping.
//!
//! The acquirer pulls frames at sensor rate and publishes accepted ones into
//! the drop-oldest capture queue. While the scene moves fast it sheds load by
//! skipping a bounded run of frames; the skip heuristic is tunable, not exact.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Frame, VideoSource};

use crate::pipeline::{
    config::{DEFAULT_CAPTURE_INTERVAL_MS, DEFAULT_MAX_FRAME_SKIP, DEFAULT_MOTION_THRESHOLD},
    data::CapturedFrame,
    queue::{PushOutcome, QueueSender},
    telemetry::spawn_thread,
    watchdog::{HealthComponent, PipelineHealth},
};

#[derive(Clone, Debug)]
pub struct AcquisitionSettings {
    /// Mean absolute luminance difference per pixel counted as fast motion.
    pub motion_threshold: f64,
    pub max_frame_skip: u32,
    pub capture_interval: Duration,
    pub verbose: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            max_frame_skip: DEFAULT_MAX_FRAME_SKIP,
            capture_interval: Duration::from_millis(DEFAULT_CAPTURE_INTERVAL_MS),
            verbose: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameDecision {
    Forward,
    Skip,
}

struct Reference {
    width: i32,
    height: i32,
    luma: Vec<u8>,
}

/// Decides per frame whether to forward it, based on motion since the previous frame.
pub struct MotionSkipper {
    threshold: f64,
    max_skip: u32,
    skipped_run: u32,
    previous: Option<Reference>,
    last_motion: Option<f64>,
}

impl MotionSkipper {
    pub fn new(threshold: f64, max_skip: u32) -> Self {
        Self {
            threshold,
            max_skip,
            skipped_run: 0,
            previous: None,
            last_motion: None,
        }
    }

    /// Motion measured on the last assessed frame; `None` when it had no comparable reference.
    pub fn last_motion(&self) -> Option<f64> {
        self.last_motion
    }

    pub fn assess(&mut self, frame: &Frame) -> FrameDecision {
        let luma = frame.luma();
        let motion = match &self.previous {
            Some(prev)
                if prev.width == frame.width
                    && prev.height == frame.height
                    && prev.luma.len() == luma.len() =>
            {
                Some(mean_abs_diff(&prev.luma, &luma))
            }
            _ => None,
        };
        self.last_motion = motion;

        let decision = match motion {
            Some(level) if level > self.threshold => {
                if self.skipped_run < self.max_skip {
                    self.skipped_run += 1;
                    FrameDecision::Skip
                } else {
                    self.skipped_run = 0;
                    FrameDecision::Forward
                }
            }
            _ => {
                self.skipped_run = 0;
                FrameDecision::Forward
            }
        };

        self.previous = Some(Reference {
            width: frame.width,
            height: frame.height,
            luma: luma.into_owned(),
        });
        decision
    }
}

fn mean_abs_diff(previous: &[u8], current: &[u8]) -> f64 {
    if current.is_empty() {
        return 0.0;
    }
    let total: u64 = previous
        .iter()
        .zip(current)
        .map(|(a, b)| a.abs_diff(*b) as u64)
        .sum();
    total as f64 / current.len() as f64
}

/// Why the acquisition loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquisitionExit {
    /// Shutdown or restart requested.
    Stopped,
    /// The source reported end of stream.
    Exhausted,
    /// Capture failed or the processor went away.
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct AcquisitionSummary {
    pub exit: AcquisitionExit,
    pub captured: u64,
    pub skipped: u64,
    /// Frame index the next attempt should start from.
    pub next_frame_index: u64,
}

pub(crate) struct AcquisitionWorker {
    pub(crate) source: Box<dyn VideoSource>,
    pub(crate) settings: AcquisitionSettings,
    pub(crate) queue: QueueSender<CapturedFrame>,
    pub(crate) first_frame_index: u64,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl AcquisitionWorker {
    pub(crate) fn spawn(self) -> io::Result<thread::JoinHandle<AcquisitionSummary>> {
        spawn_thread("tracker-acquisition", move || self.run())
    }

    fn run(self) -> AcquisitionSummary {
        let AcquisitionWorker {
            mut source,
            settings,
            queue,
            first_frame_index,
            health,
            running,
            shutdown,
        } = self;
        let _span = tracing::info_span!("acquisition.worker", source = %source.describe()).entered();

        let mut skipper = MotionSkipper::new(settings.motion_threshold, settings.max_frame_skip);
        let mut next_frame_index = first_frame_index;
        let mut captured: u64 = 0;
        let mut skipped: u64 = 0;

        let exit = loop {
            if shutdown.load(Ordering::Relaxed) || !running.load(Ordering::Relaxed) {
                break AcquisitionExit::Stopped;
            }

            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(CaptureError::EndOfStream) => {
                    info!("Video source exhausted after {captured} frames");
                    break AcquisitionExit::Exhausted;
                }
                Err(err) => {
                    error!("Capture error: {err}");
                    break AcquisitionExit::Failed(err.to_string());
                }
            };
            let stage_start = Instant::now();
            health.beat(HealthComponent::Acquisition);
            captured += 1;
            metrics::counter!("tracker_frames_captured_total").increment(1);

            match skipper.assess(&frame) {
                FrameDecision::Skip => {
                    skipped += 1;
                    metrics::counter!("tracker_frames_skipped_total").increment(1);
                    if settings.verbose {
                        debug!(
                            "Skipping frame {} (motion {:.1})",
                            frame.sequence,
                            skipper.last_motion().unwrap_or_default()
                        );
                    }
                }
                FrameDecision::Forward => {
                    let frame_index = next_frame_index;
                    next_frame_index += 1;
                    let captured_at_ms = frame.timestamp_ms;
                    match queue.push(CapturedFrame {
                        frame,
                        frame_index,
                        captured_at_ms,
                    }) {
                        Ok(PushOutcome::Replaced(stale)) if settings.verbose => {
                            warn!("Replaced {stale} unprocessed frame(s) with frame #{frame_index}");
                        }
                        Ok(_) => {}
                        Err(closed) => {
                            break AcquisitionExit::Failed(closed.to_string());
                        }
                    }
                    if frame_index % 30 == 0 {
                        debug!(
                            "Capture heartbeat: frame #{frame_index}, captured {captured}, skipped {skipped}"
                        );
                    }
                }
            }
            metrics::histogram!("tracker_stage_latency_seconds", "stage" => "acquisition")
                .record(stage_start.elapsed().as_secs_f64());

            if !settings.capture_interval.is_zero() {
                thread::sleep(settings.capture_interval);
            }
        };

        if exit == AcquisitionExit::Exhausted {
            health.retire(HealthComponent::Acquisition);
        }
        drop(source);
        debug!("Acquisition stopped ({exit:?}); video source released");

        AcquisitionSummary {
            exit,
            captured,
            skipped,
            next_frame_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use video_ingest::MemorySource;

    use super::*;
    use crate::pipeline::queue::{CAPTURE_QUEUE, OverflowPolicy, bounded_queue};

    #[test]
    fn first_frame_always_forwards() {
        let mut skipper = MotionSkipper::new(0.0, 5);
        assert_eq!(skipper.assess(&Frame::gray(4, 4, 200)), FrameDecision::Forward);
        assert_eq!(skipper.last_motion(), None);
    }

    #[test]
    fn sustained_motion_skips_up_to_the_cap() {
        let mut skipper = MotionSkipper::new(8.0, 2);
        let decisions: Vec<_> = (0..8u8)
            .map(|n| skipper.assess(&Frame::gray(8, 8, if n % 2 == 0 { 0 } else { 255 })))
            .collect();
        use FrameDecision::{Forward, Skip};
        assert_eq!(
            decisions,
            vec![Forward, Skip, Skip, Forward, Skip, Skip, Forward, Skip]
        );
    }

    #[test]
    fn calm_frame_resets_the_run() {
        let mut skipper = MotionSkipper::new(8.0, 2);
        assert_eq!(skipper.assess(&Frame::gray(8, 8, 0)), FrameDecision::Forward);
        assert_eq!(skipper.assess(&Frame::gray(8, 8, 255)), FrameDecision::Skip);
        assert_eq!(skipper.assess(&Frame::gray(8, 8, 255)), FrameDecision::Forward);
        assert_eq!(skipper.assess(&Frame::gray(8, 8, 0)), FrameDecision::Skip);
        assert_eq!(skipper.assess(&Frame::gray(8, 8, 0)), FrameDecision::Forward);
    }

    #[test]
    fn threshold_is_per_pixel_mean() {
        let mut skipper = MotionSkipper::new(8.0, 2);
        skipper.assess(&Frame::gray(100, 100, 100));
        assert_eq!(skipper.assess(&Frame::gray(100, 100, 108)), FrameDecision::Forward);
        assert_eq!(skipper.last_motion(), Some(8.0));
        assert_eq!(skipper.assess(&Frame::gray(100, 100, 117)), FrameDecision::Skip);
    }

    #[test]
    fn resolution_change_resets_reference() {
        let mut skipper = MotionSkipper::new(1.0, 2);
        skipper.assess(&Frame::gray(4, 4, 0));
        assert_eq!(skipper.assess(&Frame::gray(8, 8, 255)), FrameDecision::Forward);
        assert_eq!(skipper.last_motion(), None);
    }

    #[test]
    fn zero_cap_never_skips() {
        let mut skipper = MotionSkipper::new(0.0, 0);
        skipper.assess(&Frame::gray(2, 2, 0));
        assert_eq!(skipper.assess(&Frame::gray(2, 2, 255)), FrameDecision::Forward);
    }

    #[test]
    fn worker_forwards_frames_until_exhausted() {
        let frames = (0..3).map(|n| Frame::gray(4, 4, 10).with_sequence(n).at(1_000 + n as i64 * 33));
        let (tx, rx) = bounded_queue(CAPTURE_QUEUE, 4, OverflowPolicy::DropOldest);
        let health = Arc::new(PipelineHealth::new());
        let worker = AcquisitionWorker {
            source: Box::new(MemorySource::new(frames)),
            settings: AcquisitionSettings {
                capture_interval: Duration::ZERO,
                ..AcquisitionSettings::default()
            },
            queue: tx,
            first_frame_index: 40,
            health,
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        let summary = worker.run();
        assert_eq!(summary.exit, AcquisitionExit::Exhausted);
        assert_eq!(summary.captured, 3);
        assert_eq!(summary.next_frame_index, 43);
        let indices: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|captured| (captured.frame_index, captured.captured_at_ms))
            .collect();
        assert_eq!(indices, vec![(40, 1_000), (41, 1_033), (42, 1_066)]);
    }

    #[test]
    fn worker_stops_when_shutdown_is_set() {
        let (tx, _rx) = bounded_queue(CAPTURE_QUEUE, 1, OverflowPolicy::DropOldest);
        let worker = AcquisitionWorker {
            source: Box::new(MemorySource::new([Frame::gray(2, 2, 0)])),
            settings: AcquisitionSettings::default(),
            queue: tx,
            first_frame_index: 0,
            health: Arc::new(PipelineHealth::new()),
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(AtomicBool::new(true)),
        };
        let summary = worker.run();
        assert_eq!(summary.exit, AcquisitionExit::Stopped);
        assert_eq!(summary.captured, 0);
    }
}
