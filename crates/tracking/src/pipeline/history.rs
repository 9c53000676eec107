//! Append-only change log of entity poses with JSON export.
//!
//! Each recorder invocation writes one entry per entity under the next history
//! index. Entities that vanished this frame are recorded at their last-known
//! pose, so a disappearance shows up once in the log.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use parking_lot::Mutex;
use pose_core::{Entity, EntityId};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::pipeline::{
    data::EntityMap,
    profiles::{Profile, ProfileStore},
};

/// Scale written into every entry.
pub const DEFAULT_SCALE: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PosRot {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
    pub s: f64,
}

impl PosRot {
    fn of(entity: &Entity) -> Self {
        let position = entity.anchor();
        let rotation = entity.orientation();
        Self {
            x: position.x,
            y: position.y,
            z: position.z,
            rx: rotation.x,
            ry: rotation.y,
            rz: rotation.z,
            s: DEFAULT_SCALE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub profile: Profile,
    #[serde(rename = "pos-rot")]
    pub pos_rot: PosRot,
}

/// `entity id -> history index -> entry`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HistoryLog {
    entities: BTreeMap<EntityId, BTreeMap<u64, HistoryEntry>>,
}

impl HistoryLog {
    pub fn entry(&self, id: &EntityId, index: u64) -> Option<&HistoryEntry> {
        self.entities.get(id)?.get(&index)
    }

    pub fn entries_for(&self, id: &EntityId) -> usize {
        self.entities.get(id).map_or(0, BTreeMap::len)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    pub fn total_entries(&self) -> usize {
        self.entities.values().map(BTreeMap::len).sum()
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to serialise history")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write history to {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Default)]
struct RecorderState {
    log: HistoryLog,
    next_index: u64,
    total_entries: usize,
}

/// Shared handle to the session's history.
///
/// The orchestrator appends, the admin endpoint and shutdown path export.
/// Clones share the same log.
#[derive(Clone)]
pub struct HistoryRecorder {
    state: Arc<Mutex<RecorderState>>,
    profiles: ProfileStore,
}

impl HistoryRecorder {
    pub fn new(profiles: ProfileStore) -> Self {
        Self {
            state: Arc::new(Mutex::new(RecorderState::default())),
            profiles,
        }
    }

    /// Record `candidate` against the previously recorded `reference` and
    /// return the history index used.
    pub fn record(&self, candidate: &EntityMap, reference: &EntityMap) -> u64 {
        let profiles = self.profiles.current();
        let mut state = self.state.lock();
        let index = state.next_index;

        let mut written = 0usize;
        for (id, entity) in reference.iter().chain(candidate) {
            let current = candidate.get(id).unwrap_or(entity);
            let entry = HistoryEntry {
                profile: profiles.profile_for(id).clone(),
                pos_rot: PosRot::of(current),
            };
            let per_entity = state.log.entities.entry(id.clone()).or_default();
            if per_entity.insert(index, entry).is_none() {
                written += 1;
            }
        }

        state.next_index += 1;
        state.total_entries += written;
        metrics::gauge!("tracker_history_entries").set(state.total_entries as f64);
        index
    }

    /// Index the next recording will use, i.e. the number of recorded frames.
    pub fn next_index(&self) -> u64 {
        self.state.lock().next_index
    }

    pub fn total_entries(&self) -> usize {
        self.state.lock().total_entries
    }

    /// Ids with at least one entry, read without copying the log.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.state.lock().log.entity_ids().cloned().collect()
    }

    /// Full copy of the log; cost grows with the session.
    pub fn snapshot(&self) -> HistoryLog {
        self.state.lock().log.clone()
    }

    /// Export into `dir` under a timestamped file name.
    pub fn export(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        let file_name = format!(
            "design_history_{}.json",
            Local::now().format("%Y%m%d_%H%M%S_%3f")
        );
        self.export_to(&dir.join(file_name))
    }

    pub fn export_to(&self, path: &Path) -> Result<PathBuf, ExportError> {
        let (log, frames) = {
            let state = self.state.lock();
            (state.log.clone(), state.next_index)
        };
        let bytes = serde_json::to_vec_pretty(&log)?;
        write_atomically(path, &bytes).map_err(|source| ExportError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Exported: {} ({frames} frames)", path.display());
        Ok(path.to_path_buf())
    }
}

/// Write through a sibling temp file and rename it into place.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
