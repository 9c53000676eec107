//! Drives processing and the orchestrator cycle directly, frame by frame, so
//! queue drops cannot make outcomes timing dependent.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use actix_web::web::Bytes;
use pose_core::{Detection, DetectionOutcome, Entity, EntityId, Pose, ReplayPoseSource, Vec3};
use tokio::sync::mpsc;
use tracking::pipeline::{
    broadcast::{ChannelConsumer, Consumer, ConsumerRegistry, DeliveryError, Dispatcher},
    data::CapturedFrame,
    history::HistoryRecorder,
    orchestrator::{CycleReport, Orchestrator, OrchestratorSettings},
    processing::process_frame,
    profiles::{EntityProfiles, ProfileStore},
};
use video_ingest::Frame;

fn marker(id: &str, z: f64) -> DetectionOutcome {
    Ok(Detection::new(
        EntityId::from(id),
        Entity::Marker(Pose::new(Vec3::new(0.0, 0.0, z), Vec3::ZERO)),
    ))
}

struct Rig {
    replay: ReplayPoseSource,
    orchestrator: Orchestrator,
    registry: ConsumerRegistry,
    recorder: HistoryRecorder,
}

impl Rig {
    fn new(frames: Vec<Vec<DetectionOutcome>>) -> Self {
        let registry = ConsumerRegistry::new();
        let recorder = HistoryRecorder::new(ProfileStore::new(EntityProfiles::default()));
        let orchestrator = Orchestrator::new(
            OrchestratorSettings {
                history_dir: PathBuf::from("unused"),
                ..OrchestratorSettings::default()
            },
            recorder.clone(),
            Dispatcher::new(registry.clone(), Arc::new(AtomicBool::new(false))),
        );
        Self {
            replay: ReplayPoseSource::from_frames(frames),
            orchestrator,
            registry,
            recorder,
        }
    }

    fn step(&mut self, sequence: u64, captured_at_ms: i64) -> CycleReport {
        let captured = CapturedFrame {
            frame: Frame::gray(4, 4, 0).with_sequence(sequence).at(captured_at_ms),
            frame_index: sequence,
            captured_at_ms,
        };
        let result = process_frame(&mut self.replay, &captured);
        self.orchestrator.handle(result)
    }

    fn subscribe(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(8);
        self.registry
            .register(Arc::new(ChannelConsumer::new("test", tx)));
        rx
    }
}

fn payload(bytes: Bytes) -> serde_json::Value {
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn moving_entity_is_broadcast_and_recorded_twice() {
    let mut rig = Rig::new(vec![vec![marker("7", 1.0)], vec![marker("7", 1.02)]]);
    let mut rx = rig.subscribe();

    let first = rig.step(0, 1_000);
    let second = rig.step(1, 2_000);

    assert!(first.broadcast.is_some());
    assert!(second.broadcast.is_some());
    let _ = rx.try_recv().unwrap();
    let update = payload(rx.try_recv().unwrap());
    assert_eq!(update["type"], "tracking_update");
    assert_eq!(update["frame"], 1);
    assert_eq!(update["predicted"], true);
    assert!(update["entities"]["7"]["position"]["z"].as_f64().unwrap() > 1.0);

    let log = rig.recorder.snapshot();
    assert!(log.entries_for(&EntityId::from("7")) <= 2);
    assert_eq!(second.history_index, Some(1));
}

#[test]
fn disappearance_is_recorded_once() {
    let mut frames = vec![vec![marker("7", 1.0)]];
    frames.extend(std::iter::repeat_with(Vec::new).take(10));
    let mut rig = Rig::new(frames);

    for sequence in 0..11 {
        rig.step(sequence, sequence as i64 * 33);
    }

    let log = rig.recorder.snapshot();
    let id = EntityId::from("7");
    assert_eq!(rig.recorder.next_index(), 2);
    assert_eq!(log.entries_for(&id), 2);
    assert_eq!(log.entry(&id, 1).unwrap().pos_rot.z, 1.0);
}

struct Refusing;

impl Consumer for Refusing {
    fn deliver(&self, _payload: &Bytes) -> Result<(), DeliveryError> {
        Err(DeliveryError::Transport("socket reset".into()))
    }
}

#[test]
fn failing_consumer_is_dropped_while_others_receive() {
    let mut rig = Rig::new(vec![vec![marker("7", 1.0)]]);
    let mut first = rig.subscribe();
    let refusing = rig.registry.register(Arc::new(Refusing));
    let mut third = rig.subscribe();

    let report = rig.step(0, 0).broadcast.unwrap();

    assert_eq!(report.delivered, 2);
    assert_eq!(report.removed, vec![refusing]);
    assert!(!rig.registry.contains(refusing));
    assert_eq!(rig.registry.len(), 2);
    assert!(first.try_recv().is_ok());
    assert!(third.try_recv().is_ok());
}

#[test]
fn detection_failures_do_not_hide_other_entities() {
    let mut rig = Rig::new(vec![vec![
        marker("7", 1.0),
        Err(pose_core::DetectionFailure::entity("9", "occluded")),
    ]]);

    let report = rig.step(0, 0);

    assert_eq!(report.history_index, Some(0));
    let log = rig.recorder.snapshot();
    assert_eq!(log.entries_for(&EntityId::from("7")), 1);
    assert_eq!(log.entries_for(&EntityId::from("9")), 0);
}

#[test]
fn nothing_is_delivered_after_shutdown() {
    let registry = ConsumerRegistry::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    let recorder = HistoryRecorder::new(ProfileStore::new(EntityProfiles::default()));
    let mut orchestrator = Orchestrator::new(
        OrchestratorSettings::default(),
        recorder,
        Dispatcher::new(registry.clone(), shutdown.clone()),
    );
    let (tx, mut rx) = mpsc::channel(4);
    registry.register(Arc::new(ChannelConsumer::new("late", tx)));
    shutdown.store(true, Ordering::SeqCst);

    let mut replay = ReplayPoseSource::from_frames(vec![vec![marker("7", 1.0)]]);
    let captured = CapturedFrame {
        frame: Frame::gray(4, 4, 0),
        frame_index: 0,
        captured_at_ms: 0,
    };
    orchestrator.handle(process_frame(&mut replay, &captured));

    assert!(rx.try_recv().is_err());
}
