//! Velocity-extrapolating smoother for broadcast positions.
//!
//! Only marker positions are predicted. Rotations, hands and anything without
//! a usable time step pass through unchanged. The output is meant for
//! consumers; history and gate references keep raw values.

use std::{collections::HashMap, time::Duration};

use pose_core::{Entity, EntityId, Vec3};

use crate::pipeline::data::Snapshot;

#[derive(Clone, Debug, PartialEq)]
pub struct SmoothingSettings {
    /// Weight of the newest velocity sample.
    pub alpha: f64,
    pub lookahead: Duration,
    /// Time steps at or beyond this are too stale to extrapolate from.
    pub max_prediction_dt: Duration,
}

impl SmoothingSettings {
    pub const DEFAULT_ALPHA: f64 = 0.3;
}

impl Default for SmoothingSettings {
    fn default() -> Self {
        Self {
            alpha: Self::DEFAULT_ALPHA,
            lookahead: Duration::from_millis(20),
            max_prediction_dt: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VelocityEstimate {
    /// Units per second.
    pub velocity: Vec3,
    /// Capture time of the sample the estimate was last updated from.
    pub sampled_at_ms: i64,
}

pub struct PredictiveSmoother {
    settings: SmoothingSettings,
    velocities: HashMap<EntityId, VelocityEstimate>,
    previous: Option<Snapshot>,
}

impl PredictiveSmoother {
    pub fn new(settings: SmoothingSettings) -> Self {
        Self {
            settings,
            velocities: HashMap::new(),
            previous: None,
        }
    }

    pub fn velocity(&self, id: &EntityId) -> Option<&VelocityEstimate> {
        self.velocities.get(id)
    }

    pub fn tracked(&self) -> usize {
        self.velocities.len()
    }

    /// Feed the next raw snapshot and return its predicted counterpart.
    pub fn apply(&mut self, raw: &Snapshot) -> Snapshot {
        let mut predicted = raw.clone();

        if let Some(previous) = self.previous.as_ref() {
            let dt = (raw.captured_at_ms - previous.captured_at_ms) as f64 / 1_000.0;
            let reliable = dt > 0.0 && dt < self.settings.max_prediction_dt.as_secs_f64();
            if reliable {
                let lookahead = self.settings.lookahead.as_secs_f64();
                let alpha = self.settings.alpha;
                for (id, entity) in predicted.entities.iter_mut() {
                    let (Entity::Marker(pose), Some(Entity::Marker(old))) =
                        (entity, previous.entities.get(id))
                    else {
                        continue;
                    };
                    let instant = (pose.position - old.position) / dt;
                    let velocity = match self.velocities.get(id) {
                        Some(estimate) => estimate.velocity * (1.0 - alpha) + instant * alpha,
                        None => instant,
                    };
                    self.velocities.insert(
                        id.clone(),
                        VelocityEstimate {
                            velocity,
                            sampled_at_ms: raw.captured_at_ms,
                        },
                    );
                    pose.position = pose.position + velocity * lookahead;
                }
            }
        }

        self.velocities
            .retain(|id, _| raw.entities.contains_key(id));
        self.previous = Some(raw.clone());
        predicted
    }
}

#[cfg(test)]
mod tests {
    use pose_core::Pose;

    use super::*;
    use crate::pipeline::data::EntityMap;

    fn marker_at(frame_index: u64, at_ms: i64, id: &str, position: Vec3) -> Snapshot {
        let mut entities = EntityMap::new();
        entities.insert(
            EntityId::from(id),
            Entity::Marker(Pose::new(position, Vec3::new(0.0, 0.0, 30.0))),
        );
        Snapshot::new(frame_index, at_ms, entities)
    }

    fn position(snapshot: &Snapshot, id: &str) -> Vec3 {
        snapshot.entities[&EntityId::from(id)].anchor()
    }

    #[test]
    fn constant_velocity_converges_to_lookahead_offset() {
        let mut smoother = PredictiveSmoother::new(SmoothingSettings::default());
        let v = Vec3::new(0.3, -0.15, 0.6);
        let mut last = Snapshot::default();
        for n in 0..10u64 {
            let at_ms = 1_000 + n as i64 * 33;
            let raw = marker_at(n, at_ms, "7", v * (n as f64 * 0.033));
            last = smoother.apply(&raw);
            if n > 0 {
                let expected = position(&raw, "7") + v * 0.02;
                assert!(
                    position(&last, "7").manhattan(expected) < 1e-9,
                    "frame {n}: {:?} vs {:?}",
                    position(&last, "7"),
                    expected
                );
            }
        }
        assert_eq!(last.entities.len(), 1);
        assert_eq!(smoother.velocity(&EntityId::from("7")).unwrap().sampled_at_ms, 1_000 + 9 * 33);
    }

    #[test]
    fn velocity_blends_with_alpha() {
        let mut smoother = PredictiveSmoother::new(SmoothingSettings::default());
        smoother.apply(&marker_at(0, 0, "7", Vec3::ZERO));
        smoother.apply(&marker_at(1, 50, "7", Vec3::new(0.05, 0.0, 0.0)));
        smoother.apply(&marker_at(2, 100, "7", Vec3::new(0.05, 0.0, 0.0)));
        let estimate = smoother.velocity(&EntityId::from("7")).unwrap();
        assert!((estimate.velocity.x - 0.7).abs() < 1e-9);
    }

    #[test]
    fn first_sighting_and_stale_gaps_pass_through() {
        let mut smoother = PredictiveSmoother::new(SmoothingSettings::default());
        let first = marker_at(0, 0, "7", Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(smoother.apply(&first), first);

        let late = marker_at(1, 1_000, "7", Vec3::new(0.0, 0.0, 1.02));
        assert_eq!(smoother.apply(&late), late);
        assert!(smoother.velocity(&EntityId::from("7")).is_none());

        let same_time = marker_at(2, 1_000, "7", Vec3::new(0.0, 0.0, 1.03));
        assert_eq!(smoother.apply(&same_time), same_time);
    }

    #[test]
    fn absent_entities_lose_their_estimate() {
        let mut smoother = PredictiveSmoother::new(SmoothingSettings::default());
        smoother.apply(&marker_at(0, 0, "7", Vec3::ZERO));
        smoother.apply(&marker_at(1, 33, "7", Vec3::new(0.01, 0.0, 0.0)));
        assert_eq!(smoother.tracked(), 1);
        smoother.apply(&Snapshot::new(2, 66, EntityMap::new()));
        assert_eq!(smoother.tracked(), 0);

        let back = marker_at(3, 99, "7", Vec3::new(0.03, 0.0, 0.0));
        assert_eq!(smoother.apply(&back), back);
    }

    #[test]
    fn rotation_is_never_predicted() {
        let mut smoother = PredictiveSmoother::new(SmoothingSettings::default());
        smoother.apply(&marker_at(0, 0, "7", Vec3::ZERO));
        let out = smoother.apply(&marker_at(1, 20, "7", Vec3::new(0.02, 0.0, 0.0)));
        let Entity::Marker(pose) = &out.entities[&EntityId::from("7")] else {
            panic!("marker expected");
        };
        assert_eq!(pose.rotation, Vec3::new(0.0, 0.0, 30.0));
        assert!(pose.position.x > 0.02);
    }
}
