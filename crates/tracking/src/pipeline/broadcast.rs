//! Fan-out of tracking updates to live consumers.
//!
//! The registry is the only structure written from several threads: consumer
//! connections register and deregister from the listener runtime while the
//! orchestrator dispatches. Dispatch iterates a copy of the registry, so a
//! consumer joining or leaving mid-dispatch never disturbs the iteration.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use actix_web::web::Bytes;
use parking_lot::RwLock;
use pose_core::{Entity, EntityId, Vec3};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::pipeline::data::Snapshot;

pub type ConsumerId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("consumer disconnected")]
    Disconnected,
    #[error("consumer is not keeping up")]
    Backlogged,
    #[error("delivery failed: {0}")]
    Transport(String),
}

/// Receiving end of broadcasts. `deliver` must not block.
pub trait Consumer: Send + Sync {
    fn deliver(&self, payload: &Bytes) -> Result<(), DeliveryError>;

    fn describe(&self) -> String {
        "consumer".to_string()
    }
}

/// Consumer backed by a bounded channel drained by a connection task.
pub struct ChannelConsumer {
    label: String,
    tx: mpsc::Sender<Bytes>,
}

impl ChannelConsumer {
    pub fn new(label: impl Into<String>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            label: label.into(),
            tx,
        }
    }
}

impl Consumer for ChannelConsumer {
    fn deliver(&self, payload: &Bytes) -> Result<(), DeliveryError> {
        self.tx.try_send(payload.clone()).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Backlogged,
            TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: ConsumerId,
    consumers: BTreeMap<ConsumerId, Arc<dyn Consumer>>,
}

/// Set of live consumers.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, consumer: Arc<dyn Consumer>) -> ConsumerId {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.consumers.insert(id, consumer);
        metrics::gauge!("tracker_consumers").set(inner.consumers.len() as f64);
        id
    }

    /// Remove a consumer. Returns whether it was still registered.
    pub fn remove(&self, id: ConsumerId) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.consumers.remove(&id).is_some();
        metrics::gauge!("tracker_consumers").set(inner.consumers.len() as f64);
        removed
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        self.inner.read().consumers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().consumers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(ConsumerId, Arc<dyn Consumer>)> {
        self.inner
            .read()
            .consumers
            .iter()
            .map(|(id, consumer)| (*id, consumer.clone()))
            .collect()
    }
}

/// Deregisters a consumer when dropped.
pub struct ConsumerLease {
    registry: ConsumerRegistry,
    id: ConsumerId,
}

impl ConsumerLease {
    pub fn new(registry: ConsumerRegistry, id: ConsumerId) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        if self.registry.remove(self.id) {
            info!(
                "Consumer {} disconnected ({} remaining)",
                self.id,
                self.registry.len()
            );
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum EntityView<'a> {
    Marker {
        position: Vec3,
        rotation: Vec3,
    },
    Hand {
        position: Vec3,
        label: &'a str,
        landmarks: &'a [Vec3],
    },
}

impl<'a> From<&'a Entity> for EntityView<'a> {
    fn from(entity: &'a Entity) -> Self {
        match entity {
            Entity::Marker(pose) => EntityView::Marker {
                position: pose.position,
                rotation: pose.rotation,
            },
            Entity::Hand(hand) => EntityView::Hand {
                position: hand.centroid(),
                label: &hand.label,
                landmarks: &hand.landmarks,
            },
        }
    }
}

/// Wire form of one broadcast.
#[derive(Serialize)]
pub struct TrackingUpdate<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    entities: BTreeMap<&'a EntityId, EntityView<'a>>,
    /// Broadcast time, Unix seconds.
    timestamp: f64,
    /// Capture to result latency, seconds.
    processing_time: f64,
    frame: u64,
    predicted: bool,
}

impl<'a> TrackingUpdate<'a> {
    pub fn new(snapshot: &'a Snapshot, processing_time: f64, timestamp: f64, predicted: bool) -> Self {
        Self {
            kind: "tracking_update",
            entities: snapshot
                .entities
                .iter()
                .map(|(id, entity)| (id, EntityView::from(entity)))
                .collect(),
            timestamp,
            processing_time,
            frame: snapshot.frame_index,
            predicted,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub removed: Vec<ConsumerId>,
}

pub struct Dispatcher {
    registry: ConsumerRegistry,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(registry: ConsumerRegistry, shutdown: Arc<AtomicBool>) -> Self {
        Self { registry, shutdown }
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    pub fn broadcast(&self, update: &TrackingUpdate<'_>) -> Result<DispatchReport, serde_json::Error> {
        let payload = Bytes::from(serde_json::to_vec(update)?);
        Ok(self.dispatch(&payload))
    }

    /// Deliver identical bytes to every registered consumer; failures are removed afterwards.
    pub fn dispatch(&self, payload: &Bytes) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.shutdown.load(Ordering::Relaxed) {
            debug!("Shutdown in progress; skipping broadcast");
            return report;
        }

        let mut failed = Vec::new();
        for (id, consumer) in self.registry.snapshot() {
            match consumer.deliver(payload) {
                Ok(()) => {
                    report.delivered += 1;
                    metrics::counter!("tracker_deliveries_total", "outcome" => "delivered")
                        .increment(1);
                }
                Err(err) => {
                    metrics::counter!("tracker_deliveries_total", "outcome" => "failed")
                        .increment(1);
                    warn!("Dropping consumer {id} ({}): {err}", consumer.describe());
                    failed.push(id);
                }
            }
        }

        for id in failed {
            if self.registry.remove(id) {
                report.removed.push(id);
            }
        }
        report
    }
}
