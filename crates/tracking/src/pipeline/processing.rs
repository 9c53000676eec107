//! Pose processing worker.
//!
//! Pulls the freshest captured frame, asks the pose source for entities and
//! publishes the resulting snapshot into the drop-newest result queue. A
//! failed entity costs only that entity; the rest of the frame goes through.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::RecvTimeoutError;
use pose_core::PoseSource;
use tracing::{debug, warn};

use crate::pipeline::{
    config::DEFAULT_PROCESSOR_WAIT_MS,
    data::{CapturedFrame, EntityMap, ProcessingResult, Snapshot},
    queue::{PushOutcome, QueueReceiver, QueueSender},
    telemetry::spawn_thread,
    watchdog::{HealthComponent, PipelineHealth},
};

#[derive(Clone, Debug)]
pub struct ProcessingSettings {
    /// Bounded wait on the capture queue between shutdown checks.
    pub wait: Duration,
    pub verbose: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(DEFAULT_PROCESSOR_WAIT_MS),
            verbose: false,
        }
    }
}

/// Run the pose source over one captured frame.
pub fn process_frame(source: &mut dyn PoseSource, captured: &CapturedFrame) -> ProcessingResult {
    let detect_start = Instant::now();
    let outcomes = source.detect(&captured.frame);
    metrics::histogram!("tracker_stage_latency_seconds", "stage" => "detection")
        .record(detect_start.elapsed().as_secs_f64());

    let mut entities = EntityMap::new();
    let mut failures = 0usize;
    for outcome in outcomes {
        match outcome {
            Ok(detection) => {
                if entities.insert(detection.id.clone(), detection.entity).is_some() {
                    warn!(
                        "Frame #{} reported entity {} twice; keeping the last one",
                        captured.frame_index, detection.id
                    );
                }
            }
            Err(failure) => {
                failures += 1;
                metrics::counter!("tracker_detection_failures_total").increment(1);
                warn!("Frame #{}: {failure}", captured.frame_index);
            }
        }
    }

    let latency_ms = (Utc::now().timestamp_millis() - captured.captured_at_ms).max(0);
    ProcessingResult {
        snapshot: Snapshot::new(captured.frame_index, captured.captured_at_ms, entities),
        processing_time: Duration::from_millis(latency_ms as u64),
        failures,
    }
}

pub(crate) struct ProcessingWorker {
    pub(crate) source: Box<dyn PoseSource>,
    pub(crate) settings: ProcessingSettings,
    pub(crate) frames: QueueReceiver<CapturedFrame>,
    pub(crate) results: QueueSender<ProcessingResult>,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl ProcessingWorker {
    pub(crate) fn spawn(self) -> io::Result<thread::JoinHandle<u64>> {
        spawn_thread("tracker-processing", move || self.run())
    }

    /// Returns the number of frames processed.
    fn run(self) -> u64 {
        let ProcessingWorker {
            mut source,
            settings,
            frames,
            results,
            health,
            running,
            shutdown,
        } = self;
        let _span =
            tracing::info_span!("processing.worker", source = %source.describe()).entered();
        let mut processed: u64 = 0;

        loop {
            if shutdown.load(Ordering::Relaxed) || !running.load(Ordering::Relaxed) {
                break;
            }
            health.beat(HealthComponent::Processor);

            let captured = match frames.recv_timeout(settings.wait) {
                Ok(captured) => captured,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Capture queue closed; processing worker exiting");
                    health.retire(HealthComponent::Processor);
                    break;
                }
            };

            let stage_start = Instant::now();
            let result = process_frame(source.as_mut(), &captured);
            processed += 1;
            if settings.verbose && !result.snapshot.is_empty() {
                debug!(
                    "Frame #{}: {} entities ({} failed)",
                    result.snapshot.frame_index,
                    result.snapshot.len(),
                    result.failures
                );
            }

            let frame_index = result.snapshot.frame_index;
            match results.push(result) {
                Ok(PushOutcome::Dropped) if settings.verbose => {
                    warn!("Result queue full; dropping result for frame #{frame_index}");
                }
                Ok(_) => {}
                Err(closed) => {
                    debug!("{closed}; processing worker exiting");
                    break;
                }
            }
            metrics::histogram!("tracker_stage_latency_seconds", "stage" => "processing")
                .record(stage_start.elapsed().as_secs_f64());
        }

        processed
    }
}
