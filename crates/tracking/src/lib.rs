//! Entity tracking service: turns a video feed into a gated stream of entity
//! poses for live consumers and a per-entity design history.

pub mod pipeline;

/// Re-export run settings so callers can configure the tracker without
/// reaching into submodules.
pub use pipeline::config::{PoseSourceSpec, TrackerCliArgs, TrackerConfig};
/// Launch the tracker with a ready-made configuration.
pub use pipeline::supervisor::run;
