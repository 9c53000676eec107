//! Pipeline supervisor tying together acquisition, processing, the
//! orchestrator and the consumer server.
//!
//! Each attempt wires fresh queues and worker threads. The history recorder,
//! the profiles, the consumer registry and the server outlive attempts, so a
//! watchdog restart is invisible to connected consumers apart from a gap.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use pose_core::{ExternalPoseSource, PoseSource, ReplayPoseSource};
use tracing::{debug, error, info, warn};
use video_ingest::{FfmpegSource, VideoSource};

use crate::pipeline::{
    acquisition::{AcquisitionExit, AcquisitionSummary, AcquisitionWorker},
    broadcast::{ConsumerRegistry, Dispatcher},
    config::{PipelineSettings, PoseSourceSpec, TrackerConfig},
    history::HistoryRecorder,
    orchestrator::{Orchestrator, OrchestratorExit},
    processing::ProcessingWorker,
    profiles::ProfileStore,
    queue::{CAPTURE_QUEUE, OverflowPolicy, RESULT_QUEUE, bounded_queue},
    server::{PipelineStatus, ServerContext, spawn_consumer_server},
    telemetry,
    watchdog::{PipelineHealth, WatchdogState, spawn_watchdog},
};

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const CAPTURE_QUEUE_CAPACITY: usize = 1;

/// State that survives pipeline restarts.
#[derive(Clone)]
pub struct PipelineServices {
    pub registry: ConsumerRegistry,
    pub recorder: HistoryRecorder,
    pub profiles: ProfileStore,
    pub status: Arc<PipelineStatus>,
}

impl PipelineServices {
    pub fn new(profiles: ProfileStore) -> Self {
        Self {
            registry: ConsumerRegistry::new(),
            recorder: HistoryRecorder::new(profiles.clone()),
            profiles,
            status: Arc::new(PipelineStatus::default()),
        }
    }
}

/// Result of a single pipeline run attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

#[derive(Clone, Debug)]
pub struct AttemptReport {
    pub outcome: PipelineOutcome,
    pub acquisition: AcquisitionSummary,
    pub processed: u64,
    pub orchestrator: OrchestratorExit,
}

/// Run the tracker, automatically restarting on recoverable faults.
pub fn run(config: TrackerConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();

    let services = PipelineServices::new(ProfileStore::load_or_default(
        config.profiles_path.clone(),
    ));
    let server = spawn_consumer_server(
        config.bind,
        ServerContext {
            registry: services.registry.clone(),
            recorder: services.recorder.clone(),
            profiles: services.profiles.clone(),
            history_dir: config.pipeline.orchestrator.history_dir.clone(),
            consumer_buffer: config.consumer_buffer,
            status: services.status.clone(),
        },
    )?;
    info!(
        "Consumers can subscribe at http://{}/stream",
        server.local_addr().unwrap_or(config.bind)
    );

    let result = supervise(&config, &services, shutdown);
    server.stop();
    result
}

fn supervise(
    config: &TrackerConfig,
    services: &PipelineServices,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut attempt: u32 = 0;
    let mut next_frame_index: u64 = 0;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            // The last attempt ended without exporting; keep what was recorded.
            export_history(services, config);
            break;
        }

        let _span = tracing::info_span!(
            "tracker.pipeline",
            attempt,
            source = %config.source_uri,
            width = config.width,
            height = config.height
        )
        .entered();

        let sources = open_video_source(config)
            .and_then(|video| Ok((video, open_pose_source(&config.pose_source)?)));
        let (video, poses) = match sources {
            Ok(sources) => sources,
            Err(err) if attempt == 0 => return Err(err),
            Err(err) => {
                error!("Failed to reopen sources: {err:?}");
                attempt = attempt.saturating_add(1);
                thread::sleep(RESTART_BACKOFF);
                continue;
            }
        };

        match run_pipeline_once(
            video,
            poses,
            &config.pipeline,
            services,
            next_frame_index,
            shutdown.clone(),
        ) {
            Ok(report) => {
                next_frame_index = report.acquisition.next_frame_index;
                match report.outcome {
                    PipelineOutcome::Graceful => {
                        if report.orchestrator == OrchestratorExit::Stopped {
                            export_history(services, config);
                        }
                        break;
                    }
                    PipelineOutcome::Restart(reason) => {
                        attempt = attempt.saturating_add(1);
                        services.status.record_restart(reason);
                        metrics::counter!("tracker_pipeline_restarts_total").increment(1);
                        warn!("Pipeline restart requested (reason: {reason}), attempt #{attempt}");
                        thread::sleep(RESTART_BACKOFF);
                    }
                }
            }
            Err(err) => {
                error!("Tracker pipeline error: {err:?}");
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                attempt = attempt.saturating_add(1);
                thread::sleep(RESTART_BACKOFF);
            }
        }
    }

    Ok(())
}

fn export_history(services: &PipelineServices, config: &TrackerConfig) {
    if let Err(err) = services
        .recorder
        .export(&config.pipeline.orchestrator.history_dir)
    {
        error!("Export error: {err}");
    }
}

/// Execute the pipeline once with the given sources, returning whether to exit
/// or restart.
///
/// Frame indices start at `first_frame_index` so history stays monotonic
/// across attempts.
pub fn run_pipeline_once(
    video: Box<dyn VideoSource>,
    poses: Box<dyn PoseSource>,
    settings: &PipelineSettings,
    services: &PipelineServices,
    first_frame_index: u64,
    shutdown: Arc<AtomicBool>,
) -> Result<AttemptReport> {
    let running = Arc::new(AtomicBool::new(true));
    let health = Arc::new(PipelineHealth::new());
    let watchdog_state = Arc::new(WatchdogState::new());

    let (frame_tx, frame_rx) =
        bounded_queue(CAPTURE_QUEUE, CAPTURE_QUEUE_CAPACITY, OverflowPolicy::DropOldest);
    let (result_tx, result_rx) =
        bounded_queue(RESULT_QUEUE, settings.result_queue, OverflowPolicy::DropNewest);

    let dispatcher = Dispatcher::new(services.registry.clone(), shutdown.clone());
    let orchestrator_handle = Orchestrator::new(
        settings.orchestrator.clone(),
        services.recorder.clone(),
        dispatcher,
    )
    .spawn(result_rx, health.clone(), running.clone(), shutdown.clone())
    .context("Failed to spawn orchestrator thread")?;

    let processing_handle = ProcessingWorker {
        source: poses,
        settings: settings.processing.clone(),
        frames: frame_rx,
        results: result_tx,
        health: health.clone(),
        running: running.clone(),
        shutdown: shutdown.clone(),
    }
    .spawn()
    .inspect_err(|_| running.store(false, Ordering::SeqCst))
    .context("Failed to spawn processing thread")?;

    let acquisition_handle = AcquisitionWorker {
        source: video,
        settings: settings.acquisition.clone(),
        queue: frame_tx,
        first_frame_index,
        health: health.clone(),
        running: running.clone(),
        shutdown: shutdown.clone(),
    }
    .spawn()
    .inspect_err(|_| running.store(false, Ordering::SeqCst))
    .context("Failed to spawn acquisition thread")?;

    let watchdog_handle = spawn_watchdog(
        health.clone(),
        running.clone(),
        shutdown.clone(),
        watchdog_state.clone(),
    )
    .inspect_err(|_| running.store(false, Ordering::SeqCst))
    .context("Failed to spawn watchdog thread")?;

    let mut crashed: Option<&'static str> = None;
    let acquisition = acquisition_handle.join().unwrap_or_else(|_| {
        crashed = Some("acquisition panic");
        AcquisitionSummary {
            exit: AcquisitionExit::Failed("acquisition thread panicked".into()),
            captured: 0,
            skipped: 0,
            next_frame_index: first_frame_index,
        }
    });
    if acquisition.exit != AcquisitionExit::Exhausted {
        // Nothing left to drain; let the other stages observe the stop.
        running.store(false, Ordering::SeqCst);
    }

    let processed = processing_handle.join().unwrap_or_else(|_| {
        crashed.get_or_insert("processing panic");
        0
    });
    let orchestrator = orchestrator_handle.join().unwrap_or_else(|_| {
        crashed.get_or_insert("orchestrator panic");
        OrchestratorExit::Stopped
    });

    running.store(false, Ordering::SeqCst);
    let _ = watchdog_handle.join();
    debug!(
        "Attempt finished: {:?}, {} captured, {} skipped, {} processed, orchestrator {:?}",
        acquisition.exit, acquisition.captured, acquisition.skipped, processed, orchestrator
    );

    let outcome = if watchdog_state.is_triggered() {
        PipelineOutcome::Restart(
            watchdog_state
                .reason()
                .map(|component| component.label())
                .unwrap_or("watchdog"),
        )
    } else if let Some(reason) = crashed {
        PipelineOutcome::Restart(reason)
    } else if matches!(acquisition.exit, AcquisitionExit::Failed(_)) {
        PipelineOutcome::Restart("capture error")
    } else {
        PipelineOutcome::Graceful
    };

    Ok(AttemptReport {
        outcome,
        acquisition,
        processed,
        orchestrator,
    })
}

fn open_video_source(config: &TrackerConfig) -> Result<Box<dyn VideoSource>> {
    debug!(
        "Capture source: {} ({:?})",
        config.source_uri, config.source_kind
    );
    let source = FfmpegSource::spawn(&config.source_uri, (config.width, config.height), config.fps)
        .with_context(|| format!("Failed to open video source {}", config.source_uri))?;
    Ok(Box::new(source))
}

fn open_pose_source(spec: &PoseSourceSpec) -> Result<Box<dyn PoseSource>> {
    match spec {
        PoseSourceSpec::Replay { path, looping } => {
            let source = ReplayPoseSource::open(path)
                .with_context(|| format!("Failed to load replay {}", path.display()))?
                .looping(*looping);
            info!("Replaying {} recorded frames from {}", source.len(), path.display());
            Ok(Box::new(source))
        }
        PoseSourceSpec::External { command } => {
            let source = ExternalPoseSource::spawn(command)
                .with_context(|| format!("Failed to start detector `{command}`"))?;
            Ok(Box::new(source))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pose_core::{Detection, Entity, EntityId, Pose, Vec3};
    use video_ingest::{CaptureError, Frame, MemorySource};

    use super::*;
    use crate::pipeline::profiles::EntityProfiles;

    struct BrokenCamera;

    impl VideoSource for BrokenCamera {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            Err(CaptureError::Other(anyhow::anyhow!("device unplugged")))
        }

        fn describe(&self) -> String {
            "broken".into()
        }
    }

    fn settings(history_dir: PathBuf) -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.acquisition.capture_interval = Duration::ZERO;
        settings.orchestrator.history_dir = history_dir;
        settings
    }

    fn services() -> PipelineServices {
        PipelineServices::new(ProfileStore::new(EntityProfiles::default()))
    }

    #[test]
    fn exhausted_source_ends_gracefully_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let video = MemorySource::new((0..3).map(|n| Frame::gray(8, 8, 0).with_sequence(n).at(n as i64 * 33)));
        let marker = Entity::Marker(Pose::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ZERO));
        let poses = ReplayPoseSource::from_frames(vec![vec![Ok(Detection::new(
            EntityId::from("7"),
            marker,
        ))]])
        .looping(true);
        let services = services();

        let report = run_pipeline_once(
            Box::new(video),
            Box::new(poses),
            &settings(dir.path().to_path_buf()),
            &services,
            0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(report.outcome, PipelineOutcome::Graceful);
        assert_eq!(report.acquisition.exit, AcquisitionExit::Exhausted);
        assert_eq!(report.orchestrator, OrchestratorExit::Drained);
        assert!(services.recorder.snapshot().entries_for(&EntityId::from("7")) >= 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn capture_failure_requests_restart_without_export() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_pipeline_once(
            Box::new(BrokenCamera),
            Box::new(ReplayPoseSource::from_frames(Vec::new())),
            &settings(dir.path().to_path_buf()),
            &services(),
            42,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(report.outcome, PipelineOutcome::Restart("capture error"));
        assert_eq!(report.acquisition.next_frame_index, 42);
        assert_eq!(report.orchestrator, OrchestratorExit::Stopped);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn shutdown_before_start_is_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let video = MemorySource::new(vec![Frame::gray(8, 8, 0)]);
        let report = run_pipeline_once(
            Box::new(video),
            Box::new(ReplayPoseSource::from_frames(Vec::new())),
            &settings(dir.path().to_path_buf()),
            &services(),
            0,
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        assert_eq!(report.outcome, PipelineOutcome::Graceful);
        assert_eq!(report.acquisition.exit, AcquisitionExit::Stopped);
        assert_eq!(report.orchestrator, OrchestratorExit::Shutdown);
    }

    #[test]
    fn ctrl_c_mid_run_exports_history() {
        for _ in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            let video = MemorySource::new(
                (0..20_000u64).map(|n| Frame::gray(8, 8, 0).with_sequence(n).at(n as i64 * 33)),
            );
            let poses = ReplayPoseSource::from_frames(
                (0..4)
                    .map(|n| {
                        vec![Ok(Detection::new(
                            EntityId::from("7"),
                            Entity::Marker(Pose::new(Vec3::new(n as f64, 0.0, 1.0), Vec3::ZERO)),
                        ))]
                    })
                    .collect(),
            )
            .looping(true);
            let mut settings = settings(dir.path().to_path_buf());
            settings.acquisition.capture_interval = Duration::from_millis(1);
            let shutdown = Arc::new(AtomicBool::new(false));
            let trigger = shutdown.clone();
            let interrupter = thread::spawn(move || {
                thread::sleep(Duration::from_millis(150));
                trigger.store(true, Ordering::SeqCst);
            });

            let report = run_pipeline_once(
                Box::new(video),
                Box::new(poses),
                &settings,
                &services(),
                0,
                shutdown,
            )
            .unwrap();
            interrupter.join().unwrap();

            assert_eq!(report.outcome, PipelineOutcome::Graceful);
            assert_eq!(report.acquisition.exit, AcquisitionExit::Stopped);
            assert_eq!(report.orchestrator, OrchestratorExit::Shutdown);
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        }
    }
}
