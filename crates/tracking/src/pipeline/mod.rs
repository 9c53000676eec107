//! Real-time entity tracking pipeline: capture, pose processing, gating,
//! history and live broadcast.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `acquisition`: Frame capture with motion-adaptive skipping.
//! - `queue`: Bounded hand-off queues with drop-oldest / drop-newest overflow.
//! - `processing`: Pose extraction with per-entity failure isolation.
//! - `smoothing`: Velocity-based prediction ahead of broadcast.
//! - `gate`: Change thresholds deciding what gets recorded or broadcast.
//! - `history`: Per-entity history log and JSON export.
//! - `profiles`: Reloadable per-entity static configuration.
//! - `broadcast`: Consumer registry and update fan-out.
//! - `orchestrator`: The smooth → gate → record → broadcast cycle.
//! - `supervisor`: Thread wiring and restart handling.
//! - `server`: Actix Web endpoints for consumers and operators.
//! - `watchdog`: Health monitoring for pipeline stages.
//! - `data`: Shared structs passed between stages.

pub mod acquisition;
pub mod broadcast;
pub mod config;
pub mod data;
pub mod gate;
pub mod history;
pub mod orchestrator;
pub mod processing;
pub mod profiles;
pub mod queue;
pub mod server;
pub mod smoothing;
pub mod supervisor;
mod telemetry;
mod watchdog;
