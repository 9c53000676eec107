use std::{io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use video_ingest::Frame;

use crate::entity::{Entity, EntityId};

/// One entity resolved in a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: EntityId,
    pub entity: Entity,
}

impl Detection {
    pub fn new(id: impl Into<EntityId>, entity: Entity) -> Self {
        Self {
            id: id.into(),
            entity,
        }
    }
}

/// An entity the source saw but could not resolve (pose solve, landmark fit, ...).
///
/// `id` is `None` when the whole frame failed, e.g. the detector process died.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("detection failed for {}: {reason}", .id.as_ref().map_or("frame", EntityId::as_str))]
pub struct DetectionFailure {
    pub id: Option<EntityId>,
    pub reason: String,
}

impl DetectionFailure {
    pub fn entity(id: impl Into<EntityId>, reason: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            reason: reason.into(),
        }
    }

    pub fn frame(reason: impl Into<String>) -> Self {
        Self {
            id: None,
            reason: reason.into(),
        }
    }
}

pub type DetectionOutcome = Result<Detection, DetectionFailure>;

/// Produces entity poses for a frame.
///
/// Failures are reported per entity; a source never aborts the whole call.
pub trait PoseSource: Send {
    fn detect(&mut self, frame: &Frame) -> Vec<DetectionOutcome>;

    fn describe(&self) -> String {
        "pose source".to_string()
    }
}

impl<S: PoseSource + ?Sized> PoseSource for Box<S> {
    fn detect(&mut self, frame: &Frame) -> Vec<DetectionOutcome> {
        (**self).detect(frame)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[derive(Debug, Error)]
pub enum PoseSourceError {
    #[error("failed to read detections from {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed detections on line {line}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to start detector `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("detector command is empty")]
    EmptyCommand,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireRecord {
    Failed {
        id: Option<EntityId>,
        error: String,
    },
    Detected(Detection),
}

/// Parse one frame worth of detections: a JSON array whose elements are either
/// `{"id": .., "entity": {..}}` or `{"id": .., "error": ".."}`.
///
/// A blank line is an empty frame.
pub(crate) fn parse_frame_line(line: &str) -> Result<Vec<DetectionOutcome>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let records: Vec<WireRecord> = serde_json::from_str(trimmed)?;
    Ok(records
        .into_iter()
        .map(|record| match record {
            WireRecord::Detected(detection) => Ok(detection),
            WireRecord::Failed { id, error } => Err(DetectionFailure { id, reason: error }),
        })
        .collect())
}
