//! Watchdog that detects stalled pipeline stages and requests a restart.
//!
//! Acquisition, processing and the orchestrator each beat a heartbeat slot.
//! When one goes quiet the watchdog clears the shared `running` flag, every
//! stage winds down, and the supervisor starts a fresh attempt.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tracing::error;

use crate::pipeline::telemetry::spawn_thread;

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a stage is considered stalled.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
/// Grace period at startup before the first beat is expected.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

/// Slot value of a stage that finished and no longer beats.
const RETIRED: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Pipeline stages monitored by the watchdog.
pub(crate) enum HealthComponent {
    Acquisition,
    Processor,
    Orchestrator,
}

impl HealthComponent {
    /// Human readable label used in log messages and restart reasons.
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Acquisition => "acquisition",
            HealthComponent::Processor => "processing",
            HealthComponent::Orchestrator => "orchestrator",
        }
    }
}

/// Last heartbeat per stage, in Unix millis.
///
/// A stage that finishes on purpose (source exhausted, queue drained) retires
/// its slot so the watchdog stops expecting beats from it.
pub(crate) struct PipelineHealth {
    acquisition: AtomicU64,
    processor: AtomicU64,
    orchestrator: AtomicU64,
}

impl PipelineHealth {
    /// Initialise every slot with the startup grace deadline.
    pub(crate) fn new() -> Self {
        let now = current_millis();
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            acquisition: AtomicU64::new(grace_deadline),
            processor: AtomicU64::new(grace_deadline),
            orchestrator: AtomicU64::new(grace_deadline),
        }
    }

    fn slot(&self, component: HealthComponent) -> &AtomicU64 {
        match component {
            HealthComponent::Acquisition => &self.acquisition,
            HealthComponent::Processor => &self.processor,
            HealthComponent::Orchestrator => &self.orchestrator,
        }
    }

    /// Register a heartbeat for the supplied stage unless it has retired.
    pub(crate) fn beat(&self, component: HealthComponent) {
        let slot = self.slot(component);
        if slot.load(Ordering::Relaxed) != RETIRED {
            slot.store(current_millis(), Ordering::Relaxed);
        }
    }

    /// Stop expecting heartbeats from a stage that finished normally.
    pub(crate) fn retire(&self, component: HealthComponent) {
        self.slot(component).store(RETIRED, Ordering::Relaxed);
    }

    /// Returns the first stage that has not produced a heartbeat recently.
    pub(crate) fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        [
            HealthComponent::Acquisition,
            HealthComponent::Processor,
            HealthComponent::Orchestrator,
        ]
        .into_iter()
        .find(|component| {
            now.saturating_sub(self.slot(*component).load(Ordering::Relaxed))
                > WATCHDOG_STALE_THRESHOLD_MS
        })
    }
}

/// Shared flag recording whether, and why, the watchdog fired.
pub(crate) struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    /// Create an unarmed watchdog state.
    pub(crate) fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Record the stalled stage and mark the watchdog as fired.
    pub(crate) fn arm(&self, component: HealthComponent) {
        *self.reason.lock() = Some(component);
        self.triggered.store(true, Ordering::SeqCst);
    }

    /// Whether a restart was requested during this attempt.
    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Stage that caused the restart, if any.
    pub(crate) fn reason(&self) -> Option<HealthComponent> {
        *self.reason.lock()
    }
}

/// Spawn the watchdog thread; it exits once `running` clears or shutdown is set.
pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> io::Result<thread::JoinHandle<()>> {
    spawn_thread("tracker-watchdog", move || {
        while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let now = current_millis();
            if let Some(component) = health.stale_component(now) {
                error!(
                    "Watchdog detected stalled {} stage; requesting pipeline restart",
                    component.label()
                );
                state.arm(component);
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    })
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
