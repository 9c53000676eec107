use std::{collections::BTreeMap, time::Duration};

use pose_core::{Entity, EntityId};
use video_ingest::Frame;

pub type EntityMap = BTreeMap<EntityId, Entity>;

/// Entities visible in one processed frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// Pipeline frame index, strictly increasing across accepted frames.
    pub frame_index: u64,
    /// Capture time in Unix millis.
    pub captured_at_ms: i64,
    pub entities: EntityMap,
}

impl Snapshot {
    pub fn new(frame_index: u64, captured_at_ms: i64, entities: EntityMap) -> Self {
        Self {
            frame_index,
            captured_at_ms,
            entities,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Frame accepted by the acquirer, waiting in the capture queue.
pub struct CapturedFrame {
    pub frame: Frame,
    pub frame_index: u64,
    pub captured_at_ms: i64,
}

/// Processor output consumed by the orchestrator.
#[derive(Clone, Debug)]
pub struct ProcessingResult {
    pub snapshot: Snapshot,
    /// Capture to end of detection.
    pub processing_time: Duration,
    /// Entities the pose source failed to resolve in this frame.
    pub failures: usize,
}
