//! Change gating: decide whether a snapshot differs enough from a reference to
//! be worth recording or broadcasting.

use pose_core::EntityId;
use thiserror::Error;

use crate::pipeline::data::EntityMap;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateThresholds {
    /// Summed absolute position delta (detector units).
    pub position: f64,
    /// Summed absolute rotation delta (degrees).
    pub rotation: f64,
}

#[derive(Debug, Error)]
#[error("gate thresholds must be finite and non-negative (position {position}, rotation {rotation})")]
pub struct InvalidThresholds {
    pub position: f64,
    pub rotation: f64,
}

impl GateThresholds {
    pub const HISTORY: GateThresholds = GateThresholds {
        position: 0.015,
        rotation: 2.0,
    };
    pub const BROADCAST: GateThresholds = GateThresholds {
        position: 0.003,
        rotation: 0.3,
    };

    pub fn new(position: f64, rotation: f64) -> Result<Self, InvalidThresholds> {
        let valid = |value: f64| value.is_finite() && value >= 0.0;
        if valid(position) && valid(rotation) {
            Ok(Self { position, rotation })
        } else {
            Err(InvalidThresholds { position, rotation })
        }
    }
}

/// Why a gate let a snapshot through, or that it did not.
#[derive(Clone, Debug, PartialEq)]
pub enum GateDecision {
    /// Entity count differs, an entity is new, or an entity changed kind.
    MembershipChanged,
    Moved { id: EntityId, delta: f64 },
    Rotated { id: EntityId, delta: f64 },
    Suppressed,
}

impl GateDecision {
    pub fn passes(&self) -> bool {
        !matches!(self, GateDecision::Suppressed)
    }
}

#[derive(Clone, Debug)]
pub struct ChangeGate {
    name: &'static str,
    thresholds: GateThresholds,
}

impl ChangeGate {
    pub fn new(name: &'static str, thresholds: GateThresholds) -> Self {
        Self { name, thresholds }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn thresholds(&self) -> GateThresholds {
        self.thresholds
    }

    pub fn admits(&self, candidate: &EntityMap, reference: &EntityMap) -> bool {
        self.evaluate(candidate, reference).passes()
    }

    pub fn evaluate(&self, candidate: &EntityMap, reference: &EntityMap) -> GateDecision {
        if candidate.len() != reference.len() {
            return GateDecision::MembershipChanged;
        }

        for (id, entity) in candidate {
            let Some(previous) = reference.get(id) else {
                return GateDecision::MembershipChanged;
            };
            if !entity.same_kind(previous) {
                return GateDecision::MembershipChanged;
            }

            let moved = entity.anchor().manhattan(previous.anchor());
            if moved > self.thresholds.position {
                return GateDecision::Moved {
                    id: id.clone(),
                    delta: moved,
                };
            }
            let rotated = entity.orientation().manhattan(previous.orientation());
            if rotated > self.thresholds.rotation {
                return GateDecision::Rotated {
                    id: id.clone(),
                    delta: rotated,
                };
            }
        }

        GateDecision::Suppressed
    }
}
