//! Configuration parsing for the tracking pipeline.
//!
//! This module owns translation of CLI arguments into a `TrackerConfig` struct
//! which downstream stages use without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use video_ingest::SourceKind;

use crate::pipeline::{
    acquisition::AcquisitionSettings, gate::GateThresholds, orchestrator::OrchestratorSettings,
    processing::ProcessingSettings, smoothing::SmoothingSettings,
};

pub const DEFAULT_SOURCE: &str = "0";
pub const DEFAULT_WIDTH: i32 = 640;
pub const DEFAULT_HEIGHT: i32 = 480;
pub const DEFAULT_MOTION_THRESHOLD: f64 = 8.0;
pub const DEFAULT_MAX_FRAME_SKIP: u32 = 2;
pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 3;
pub const DEFAULT_PROCESSOR_WAIT_MS: u64 = 100;
pub const DEFAULT_ORCHESTRATOR_WAIT_MS: u64 = 50;
pub const DEFAULT_ORCHESTRATOR_YIELD_MS: u64 = 1;
pub const DEFAULT_RESULT_QUEUE: usize = 5;
pub const MAX_RESULT_QUEUE: usize = 64;
pub const DEFAULT_CONSUMER_BUFFER: usize = 16;
pub const DEFAULT_BIND: &str = "127.0.0.1:8765";
pub const DEFAULT_HISTORY_DIR: &str = "design_histories";

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where entity poses come from.
pub enum PoseSourceSpec {
    /// Recorded detections, one JSON array per frame.
    Replay { path: PathBuf, looping: bool },
    /// Detector process speaking the line protocol on stdin/stdout.
    External { command: String },
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct TrackerConfig {
    /// Camera URI, device index or file path.
    pub source_uri: String,
    /// Source transport used to acquire frames.
    pub source_kind: SourceKind,
    /// Capture width requested from the source.
    pub width: i32,
    /// Capture height requested from the source.
    pub height: i32,
    /// Optional device frame rate.
    pub fps: Option<u32>,
    /// Pose source feeding the processor.
    pub pose_source: PoseSourceSpec,
    /// Stage settings derived from flags.
    pub pipeline: PipelineSettings,
    /// Per-entity profile JSON, reloadable at runtime.
    pub profiles_path: Option<PathBuf>,
    /// Directory receiving history exports.
    pub history_dir: PathBuf,
    /// Consumer listener address.
    pub bind: SocketAddr,
    /// Per-consumer buffered updates before the consumer counts as failed.
    pub consumer_buffer: usize,
    /// Emit verbose logging (frame drops, detection details).
    pub verbose: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log level to `debug`.
    pub verbose: bool,
}

#[derive(Clone, Debug)]
/// Settings for the three pipeline stages and the queue between them.
pub struct PipelineSettings {
    pub acquisition: AcquisitionSettings,
    pub processing: ProcessingSettings,
    pub orchestrator: OrchestratorSettings,
    /// Capacity of the drop-newest result queue.
    pub result_queue: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionSettings::default(),
            processing: ProcessingSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            result_queue: DEFAULT_RESULT_QUEUE,
        }
    }
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct TrackerCliArgs {
    /// Camera index, `/dev/videoN`, RTSP URL or video file.
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,
    /// Source flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// Capture width in pixels.
    #[arg(long, value_name = "PX", default_value_t = DEFAULT_WIDTH)]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(long, value_name = "PX", default_value_t = DEFAULT_HEIGHT)]
    pub height: i32,
    /// Requested device frame rate.
    #[arg(long, value_name = "FPS")]
    pub fps: Option<u32>,

    /// Replay recorded detections (JSON lines) instead of running a detector.
    #[arg(long, value_name = "PATH", conflicts_with = "detector")]
    pub replay: Option<PathBuf>,
    /// Restart the replay from the top when it runs out.
    #[arg(long = "replay-loop", action = clap::ArgAction::SetTrue, requires = "replay")]
    pub replay_loop: bool,
    /// Detector command line; receives frames on stdin, answers detections on stdout.
    #[arg(long, value_name = "CMD")]
    pub detector: Option<String>,

    /// Mean absolute luminance difference per pixel that counts as fast motion.
    #[arg(long = "motion-threshold", value_name = "LEVEL", default_value_t = DEFAULT_MOTION_THRESHOLD)]
    pub motion_threshold: f64,
    /// Consecutive frames skipped while motion stays high.
    #[arg(long = "max-frame-skip", value_name = "N", default_value_t = DEFAULT_MAX_FRAME_SKIP)]
    pub max_frame_skip: u32,
    /// Pause between capture attempts.
    #[arg(long = "capture-interval-ms", value_name = "MS", default_value_t = DEFAULT_CAPTURE_INTERVAL_MS)]
    pub capture_interval_ms: u64,
    /// Processor wait on the capture queue before re-checking shutdown.
    #[arg(long = "processor-wait-ms", value_name = "MS", default_value_t = DEFAULT_PROCESSOR_WAIT_MS)]
    pub processor_wait_ms: u64,
    /// Orchestrator wait on the result queue before re-checking shutdown.
    #[arg(long = "orchestrator-wait-ms", value_name = "MS", default_value_t = DEFAULT_ORCHESTRATOR_WAIT_MS)]
    pub orchestrator_wait_ms: u64,
    /// Orchestrator pause after each cycle.
    #[arg(long = "orchestrator-yield-ms", value_name = "MS", default_value_t = DEFAULT_ORCHESTRATOR_YIELD_MS)]
    pub orchestrator_yield_ms: u64,
    /// Result queue capacity (1-64).
    #[arg(long = "result-queue", value_name = "N", default_value_t = DEFAULT_RESULT_QUEUE)]
    pub result_queue: usize,

    /// Position change that records a history entry.
    #[arg(long = "history-pos-threshold", value_name = "UNITS", default_value_t = GateThresholds::HISTORY.position)]
    pub history_pos_threshold: f64,
    /// Rotation change (degrees) that records a history entry.
    #[arg(long = "history-rot-threshold", value_name = "DEG", default_value_t = GateThresholds::HISTORY.rotation)]
    pub history_rot_threshold: f64,
    /// Position change that triggers a broadcast.
    #[arg(long = "broadcast-pos-threshold", value_name = "UNITS", default_value_t = GateThresholds::BROADCAST.position)]
    pub broadcast_pos_threshold: f64,
    /// Rotation change (degrees) that triggers a broadcast.
    #[arg(long = "broadcast-rot-threshold", value_name = "DEG", default_value_t = GateThresholds::BROADCAST.rotation)]
    pub broadcast_rot_threshold: f64,

    /// Weight of the newest velocity sample (0-1].
    #[arg(long = "smoothing-alpha", value_name = "ALPHA", default_value_t = SmoothingSettings::DEFAULT_ALPHA)]
    pub smoothing_alpha: f64,
    /// How far ahead broadcast positions are extrapolated.
    #[arg(long = "lookahead-ms", value_name = "MS", default_value_t = 20)]
    pub lookahead_ms: u64,
    /// Frame gaps at or beyond this are too long to extrapolate from.
    #[arg(long = "max-prediction-dt-ms", value_name = "MS", default_value_t = 100)]
    pub max_prediction_dt_ms: u64,

    /// Per-entity profile JSON (`{"markers": {..}, "default": {..}}`).
    #[arg(long, value_name = "PATH")]
    pub profiles: Option<PathBuf>,
    /// Directory receiving history exports.
    #[arg(long = "history-dir", value_name = "DIR", default_value = DEFAULT_HISTORY_DIR)]
    pub history_dir: PathBuf,
    /// Consumer listener address.
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,
    /// Buffered updates per consumer before it is dropped as too slow.
    #[arg(long = "consumer-buffer", value_name = "N", default_value_t = DEFAULT_CONSUMER_BUFFER)]
    pub consumer_buffer: usize,

    /// Enable verbose logging (frame drops, detection failures).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<TrackerCliArgs> for TrackerConfig {
    type Error = anyhow::Error;

    fn try_from(args: TrackerCliArgs) -> Result<Self> {
        let source_uri = args
            .source_flag
            .or(args.source)
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string());

        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }

        let pose_source = match (args.replay, args.detector) {
            (Some(path), None) => PoseSourceSpec::Replay {
                path,
                looping: args.replay_loop,
            },
            (None, Some(command)) if !command.trim().is_empty() => {
                PoseSourceSpec::External { command }
            }
            (None, Some(_)) => bail!("--detector must name a command"),
            (Some(_), Some(_)) => bail!("--replay and --detector are mutually exclusive"),
            (None, None) => {
                return Err(anyhow!(
                    "Missing pose source. Provide --replay <jsonl> or --detector <command>."
                ));
            }
        };

        if !args.motion_threshold.is_finite() || args.motion_threshold < 0.0 {
            bail!("--motion-threshold must be a non-negative number");
        }

        if !(1..=MAX_RESULT_QUEUE).contains(&args.result_queue) {
            bail!("--result-queue must be between 1 and {MAX_RESULT_QUEUE}");
        }

        if args.consumer_buffer == 0 {
            bail!("--consumer-buffer must be at least 1");
        }

        if args.processor_wait_ms == 0 || args.orchestrator_wait_ms == 0 {
            bail!("queue waits must be at least 1 ms");
        }

        let history_gate =
            GateThresholds::new(args.history_pos_threshold, args.history_rot_threshold)?;
        let broadcast_gate =
            GateThresholds::new(args.broadcast_pos_threshold, args.broadcast_rot_threshold)?;

        if !(args.smoothing_alpha > 0.0 && args.smoothing_alpha <= 1.0) {
            bail!("--smoothing-alpha must be in (0, 1]");
        }
        if args.max_prediction_dt_ms == 0 {
            bail!("--max-prediction-dt-ms must be at least 1");
        }
        let smoothing = SmoothingSettings {
            alpha: args.smoothing_alpha,
            lookahead: Duration::from_millis(args.lookahead_ms),
            max_prediction_dt: Duration::from_millis(args.max_prediction_dt_ms),
        };

        let pipeline = PipelineSettings {
            acquisition: AcquisitionSettings {
                motion_threshold: args.motion_threshold,
                max_frame_skip: args.max_frame_skip,
                capture_interval: Duration::from_millis(args.capture_interval_ms),
                verbose: args.verbose,
            },
            processing: ProcessingSettings {
                wait: Duration::from_millis(args.processor_wait_ms),
                verbose: args.verbose,
            },
            orchestrator: OrchestratorSettings {
                wait: Duration::from_millis(args.orchestrator_wait_ms),
                yield_interval: Duration::from_millis(args.orchestrator_yield_ms),
                history_gate,
                broadcast_gate,
                smoothing,
                history_dir: args.history_dir.clone(),
            },
            result_queue: args.result_queue,
        };

        let telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace,
            verbose: args.verbose,
        };

        let source_kind = SourceKind::from_uri(&source_uri);

        Ok(Self {
            source_uri,
            source_kind,
            width: args.width,
            height: args.height,
            fps: args.fps,
            pose_source,
            pipeline,
            profiles_path: args.profiles,
            history_dir: args.history_dir,
            bind: args.bind,
            consumer_buffer: args.consumer_buffer,
            verbose: args.verbose,
            telemetry,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: TrackerCliArgs,
    }

    fn parse(argv: &[&str]) -> Result<TrackerConfig> {
        let harness = Harness::try_parse_from(std::iter::once("tracker").chain(argv.iter().copied()))?;
        TrackerConfig::try_from(harness.args)
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&["--replay", "detections.jsonl"]).unwrap();
        assert_eq!(config.source_uri, "0");
        assert_eq!(config.source_kind, SourceKind::Device);
        assert_eq!(config.pipeline.result_queue, 5);
        assert_eq!(config.pipeline.acquisition.max_frame_skip, 2);
        assert_eq!(config.pipeline.orchestrator.history_gate, GateThresholds::HISTORY);
        assert_eq!(config.pipeline.orchestrator.broadcast_gate, GateThresholds::BROADCAST);
        assert_eq!(
            config.pipeline.orchestrator.smoothing.lookahead,
            Duration::from_millis(20)
        );
        assert_eq!(config.bind, DEFAULT_BIND.parse().unwrap());
    }

    #[test]
    fn source_flag_overrides_positional() {
        let config = parse(&[
            "clip.mp4",
            "--source",
            "rtsp://cam/live",
            "--detector",
            "pose-detector --hands",
        ])
        .unwrap();
        assert_eq!(config.source_uri, "rtsp://cam/live");
        assert_eq!(config.source_kind, SourceKind::Rtsp);
        assert_eq!(
            config.pose_source,
            PoseSourceSpec::External {
                command: "pose-detector --hands".into()
            }
        );
    }

    #[test]
    fn pose_source_is_required() {
        assert!(parse(&["0"]).is_err());
    }

    #[test]
    fn result_queue_is_bounded() {
        assert!(parse(&["--replay", "d.jsonl", "--result-queue", "0"]).is_err());
        assert!(parse(&["--replay", "d.jsonl", "--result-queue", "65"]).is_err());
        assert!(parse(&["--replay", "d.jsonl", "--result-queue", "10"]).is_ok());
    }

    #[test]
    fn rejects_negative_thresholds() {
        assert!(parse(&["--replay", "d.jsonl", "--broadcast-pos-threshold=-1"]).is_err());
        assert!(parse(&["--replay", "d.jsonl", "--smoothing-alpha", "0"]).is_err());
    }
}
