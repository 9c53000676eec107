//! Tracing subscriber setup and the process-wide Prometheus recorder.

use std::{fs::File, io, sync::OnceLock, thread, time::Duration};

use metrics::Unit;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    EnvFilter,
    filter::filter_fn,
    fmt::{self, time::uptime},
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25];

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the thread-default subscriber and trace file alive for a run.
pub(crate) struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<FlushGuard>,
}

/// Install the Prometheus recorder once per process and return its handle.
pub(crate) fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let builder = match builder.set_buckets_for_metric(
            Matcher::Full("tracker_stage_latency_seconds".into()),
            LATENCY_BUCKETS,
        ) {
            Ok(builder) => builder,
            Err(err) => {
                warn!("latency buckets rejected, using summaries: {err}");
                PrometheusBuilder::new()
            }
        };
        let recorder = builder.build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            warn!("metrics recorder already installed; /metrics stays empty: {err}");
        }
        describe_metrics();

        let upkeep = handle.clone();
        if let Err(err) = spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(UPKEEP_INTERVAL);
                upkeep.run_upkeep();
            }
        }) {
            warn!("failed to spawn prometheus upkeep thread: {err}");
        }

        handle
    })
}

pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

fn describe_metrics() {
    metrics::describe_counter!(
        "tracker_frames_captured_total",
        "Frames read from the video source"
    );
    metrics::describe_counter!(
        "tracker_frames_skipped_total",
        "Frames skipped while the scene moved fast"
    );
    metrics::describe_counter!(
        "tracker_queue_dropped_total",
        "Items discarded by a bounded queue overflow"
    );
    metrics::describe_gauge!("tracker_queue_depth", "Items waiting in a queue");
    metrics::describe_counter!(
        "tracker_detection_failures_total",
        "Entities the pose source failed to resolve"
    );
    metrics::describe_histogram!(
        "tracker_stage_latency_seconds",
        Unit::Seconds,
        "Time spent per stage iteration"
    );
    metrics::describe_gauge!("tracker_processing_fps", "Results handled per second");
    metrics::describe_counter!("tracker_history_passes_total", "History gate passes");
    metrics::describe_gauge!("tracker_history_entries", "Entries held in the history log");
    metrics::describe_counter!("tracker_broadcast_passes_total", "Broadcast gate passes");
    metrics::describe_counter!(
        "tracker_deliveries_total",
        "Per-consumer delivery attempts by outcome"
    );
    metrics::describe_gauge!("tracker_consumers", "Registered consumers");
    metrics::describe_counter!(
        "tracker_pipeline_restarts_total",
        "Pipeline attempts restarted by the supervisor"
    );
}

/// Install the thread-default subscriber for a tracker run.
///
/// `RUST_LOG` wins over the verbosity flag. With a Chrome trace path, spans
/// (not events) are also written to that file.
pub(crate) fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let mut chrome_guard = None;
    let chrome_layer = opts.chrome_trace_path.as_ref().and_then(|path| {
        match File::create(path) {
            Ok(file) => {
                let (layer, guard) = ChromeLayerBuilder::new()
                    .writer(file)
                    .include_args(true)
                    .trace_style(TraceStyle::Threaded)
                    .build();
                chrome_guard = Some(guard);
                Some(layer.with_filter(filter_fn(|metadata| metadata.is_span())))
            }
            Err(err) => {
                warn!("failed to create chrome trace at {}: {err}", path.display());
                None
            }
        }
    });

    let subscriber = tracing_subscriber::registry()
        .with(chrome_layer)
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default());

    TelemetryGuard {
        _default_guard: tracing::subscriber::set_default(subscriber),
        _chrome_guard: chrome_guard,
    }
}

/// Spawn a named thread that logs through the caller's dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
