//! Orchestrator cycle: smooth, gate, record, broadcast.
//!
//! The history gate compares raw snapshots against the last recorded one. The
//! broadcast gate compares the predicted snapshot against the raw snapshot of
//! the last broadcast, so prediction never drifts the reference.

use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::pipeline::{
    broadcast::{DispatchReport, Dispatcher, TrackingUpdate},
    config::{DEFAULT_HISTORY_DIR, DEFAULT_ORCHESTRATOR_WAIT_MS, DEFAULT_ORCHESTRATOR_YIELD_MS},
    data::{EntityMap, ProcessingResult},
    gate::{ChangeGate, GateThresholds},
    history::HistoryRecorder,
    queue::QueueReceiver,
    smoothing::{PredictiveSmoother, SmoothingSettings},
    telemetry::spawn_thread,
    watchdog::{HealthComponent, PipelineHealth},
};

const FPS_REPORT_EVERY: u64 = 30;

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// Bounded wait on the result queue between shutdown checks.
    pub wait: Duration,
    /// Pause after each handled result.
    pub yield_interval: Duration,
    pub history_gate: GateThresholds,
    pub broadcast_gate: GateThresholds,
    pub smoothing: SmoothingSettings,
    /// Export target when the pipeline winds down.
    pub history_dir: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(DEFAULT_ORCHESTRATOR_WAIT_MS),
            yield_interval: Duration::from_millis(DEFAULT_ORCHESTRATOR_YIELD_MS),
            history_gate: GateThresholds::HISTORY,
            broadcast_gate: GateThresholds::BROADCAST,
            smoothing: SmoothingSettings::default(),
            history_dir: PathBuf::from(DEFAULT_HISTORY_DIR),
        }
    }
}

/// What one cycle did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    /// History index written, if the history gate passed.
    pub history_index: Option<u64>,
    /// Delivery outcome, if the broadcast gate passed.
    pub broadcast: Option<DispatchReport>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorExit {
    /// Process shutdown requested.
    Shutdown,
    /// Upstream stages finished and the result queue is empty.
    Drained,
    /// Restart requested by the watchdog.
    Stopped,
}

struct FpsMeter {
    count: u64,
    window_start: Instant,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Count one result; returns the rate once per reporting window.
    fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        if self.count % FPS_REPORT_EVERY != 0 {
            return None;
        }
        let elapsed = self.window_start.elapsed().as_secs_f64();
        self.window_start = Instant::now();
        (elapsed > 0.0).then(|| FPS_REPORT_EVERY as f64 / elapsed)
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    smoother: PredictiveSmoother,
    history_gate: ChangeGate,
    broadcast_gate: ChangeGate,
    last_recorded: EntityMap,
    last_broadcast: EntityMap,
    last_frame_index: Option<u64>,
    recorder: HistoryRecorder,
    dispatcher: Dispatcher,
    fps: FpsMeter,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, recorder: HistoryRecorder, dispatcher: Dispatcher) -> Self {
        Self {
            smoother: PredictiveSmoother::new(settings.smoothing.clone()),
            history_gate: ChangeGate::new("history", settings.history_gate),
            broadcast_gate: ChangeGate::new("broadcast", settings.broadcast_gate),
            last_recorded: EntityMap::new(),
            last_broadcast: EntityMap::new(),
            last_frame_index: None,
            recorder,
            dispatcher,
            fps: FpsMeter::new(),
            settings,
        }
    }

    pub fn recorder(&self) -> &HistoryRecorder {
        &self.recorder
    }

    pub fn handle(&mut self, result: ProcessingResult) -> CycleReport {
        let ProcessingResult {
            snapshot: raw,
            processing_time,
            ..
        } = result;
        let _span = tracing::info_span!(
            "orchestrator.cycle",
            frame = raw.frame_index,
            entities = raw.len()
        )
        .entered();
        let mut report = CycleReport::default();

        if let Some(last) = self.last_frame_index {
            if raw.frame_index <= last {
                warn!(
                    "Ignoring out-of-order frame #{} (last handled #{last})",
                    raw.frame_index
                );
                return report;
            }
        }
        self.last_frame_index = Some(raw.frame_index);

        let stage_start = Instant::now();
        let predicted = self.smoother.apply(&raw);

        if self.history_gate.admits(&raw.entities, &self.last_recorded) {
            let index = self.recorder.record(&raw.entities, &self.last_recorded);
            metrics::counter!("tracker_history_passes_total").increment(1);
            self.last_recorded = raw.entities.clone();
            report.history_index = Some(index);
        }

        let decision = self
            .broadcast_gate
            .evaluate(&predicted.entities, &self.last_broadcast);
        if decision.passes() {
            metrics::counter!("tracker_broadcast_passes_total").increment(1);
            let timestamp = Utc::now().timestamp_millis() as f64 / 1_000.0;
            let update =
                TrackingUpdate::new(&predicted, processing_time.as_secs_f64(), timestamp, true);
            match self.dispatcher.broadcast(&update) {
                Ok(dispatch) => report.broadcast = Some(dispatch),
                Err(err) => error!("Failed to serialise tracking update: {err}"),
            }
            debug!("Broadcast frame #{} ({decision:?})", raw.frame_index);
            self.last_broadcast = raw.entities;
        }

        metrics::histogram!("tracker_stage_latency_seconds", "stage" => "orchestrator")
            .record(stage_start.elapsed().as_secs_f64());
        if let Some(fps) = self.fps.tick() {
            metrics::gauge!("tracker_processing_fps").set(fps);
            info!(
                "Processing FPS: {fps:.1} | Frames: {} | Consumers: {}",
                self.recorder.next_index(),
                self.dispatcher.registry().len()
            );
        }
        report
    }

    pub(crate) fn spawn(
        self,
        results: QueueReceiver<ProcessingResult>,
        health: Arc<PipelineHealth>,
        running: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<thread::JoinHandle<OrchestratorExit>> {
        spawn_thread("tracker-orchestrator", move || {
            self.run(results, health, running, shutdown)
        })
    }

    pub(crate) fn run(
        mut self,
        results: QueueReceiver<ProcessingResult>,
        health: Arc<PipelineHealth>,
        running: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> OrchestratorExit {
        let exit = loop {
            if shutdown.load(Ordering::SeqCst) {
                break OrchestratorExit::Shutdown;
            }
            if !running.load(Ordering::SeqCst) {
                break OrchestratorExit::Stopped;
            }
            health.beat(HealthComponent::Orchestrator);

            match results.recv_timeout(self.settings.wait) {
                Ok(result) => {
                    self.handle(result);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) if shutdown.load(Ordering::SeqCst) => {
                    break OrchestratorExit::Shutdown;
                }
                Err(RecvTimeoutError::Disconnected) if !running.load(Ordering::SeqCst) => {
                    break OrchestratorExit::Stopped;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Result queue drained; orchestrator finishing");
                    health.retire(HealthComponent::Orchestrator);
                    break OrchestratorExit::Drained;
                }
            }

            if !self.settings.yield_interval.is_zero() {
                thread::sleep(self.settings.yield_interval);
            }
        };

        if exit != OrchestratorExit::Stopped {
            if let Err(err) = self.recorder.export(&self.settings.history_dir) {
                error!("Export error: {err}");
            }
        }
        exit
    }
}
