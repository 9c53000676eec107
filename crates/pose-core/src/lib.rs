//! Entity model shared by the tracker plus the adapters that turn frames into
//! entity poses.
//!
//! Detection itself happens elsewhere: [`ReplayPoseSource`] plays back recorded
//! detections and [`ExternalPoseSource`] drives a detector process over pipes.

pub mod entity;
pub mod external;
pub mod replay;
pub mod source;

pub use entity::{Entity, EntityId, Hand, Pose, Vec3};
pub use external::ExternalPoseSource;
pub use replay::ReplayPoseSource;
pub use source::{Detection, DetectionFailure, DetectionOutcome, PoseSource, PoseSourceError};
