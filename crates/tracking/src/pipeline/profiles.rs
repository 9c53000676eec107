//! Static per-entity profiles merged into history entries.
//!
//! File format: `{"markers": {"7": {...}}, "default": {...}}`. A profile is an
//! arbitrary JSON object; the tracker never interprets its fields.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use pose_core::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, warn};

pub type Profile = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ProfileLoadError {
    #[error("failed to read profiles from {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed profiles in {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no profile file configured")]
    NotConfigured,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityProfiles {
    #[serde(default)]
    pub markers: BTreeMap<String, Profile>,
    #[serde(default = "builtin_default_profile")]
    pub default: Profile,
}

fn builtin_default_profile() -> Profile {
    match json!({
        "width": "256px",
        "height": "144px",
        "src": "about:blank",
        "clip_path": "circle(50% at 50% 50%)",
    }) {
        Value::Object(map) => map,
        _ => Profile::new(),
    }
}

impl Default for EntityProfiles {
    fn default() -> Self {
        Self {
            markers: BTreeMap::new(),
            default: builtin_default_profile(),
        }
    }
}

impl EntityProfiles {
    pub fn load(path: &Path) -> Result<Self, ProfileLoadError> {
        let contents = fs::read_to_string(path).map_err(|source| ProfileLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ProfileLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn profile_for(&self, id: &EntityId) -> &Profile {
        self.markers.get(id.as_str()).unwrap_or(&self.default)
    }
}

/// Shared, hot-swappable profile set.
#[derive(Clone)]
pub struct ProfileStore {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<EntityProfiles>>>,
}

impl ProfileStore {
    pub fn new(profiles: EntityProfiles) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(Arc::new(profiles))),
        }
    }

    /// Load `path` if given; any failure falls back to the built-in default.
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        let profiles = match path.as_deref() {
            Some(path) => match EntityProfiles::load(path) {
                Ok(profiles) => {
                    info!(
                        "Loaded profiles for {} entities from {}",
                        profiles.markers.len(),
                        path.display()
                    );
                    profiles
                }
                Err(err) => {
                    warn!("{err}: {}; using built-in default profile", error_detail(&err));
                    EntityProfiles::default()
                }
            },
            None => EntityProfiles::default(),
        };
        Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(profiles))),
        }
    }

    pub fn current(&self) -> Arc<EntityProfiles> {
        self.current.read().clone()
    }

    /// Re-read the configured file. On failure the profiles in use are kept.
    pub fn reload(&self) -> Result<usize, ProfileLoadError> {
        let path = self.path.as_deref().ok_or(ProfileLoadError::NotConfigured)?;
        let profiles = EntityProfiles::load(path)?;
        let count = profiles.markers.len();
        *self.current.write() = Arc::new(profiles);
        info!("Reloaded profiles for {count} entities from {}", path.display());
        Ok(count)
    }
}

fn error_detail(err: &ProfileLoadError) -> String {
    std::error::Error::source(err)
        .map(|source| source.to_string())
        .unwrap_or_default()
}
