use std::sync::{Arc, atomic::AtomicBool};

use pose_core::{Detection, Entity, EntityId, Pose, ReplayPoseSource, Vec3};
use tracking::pipeline::{
    config::PipelineSettings,
    orchestrator::OrchestratorExit,
    profiles::{EntityProfiles, ProfileStore},
    supervisor::{PipelineOutcome, PipelineServices, run_pipeline_once},
};
use video_ingest::{Frame, MemorySource};

#[test]
fn replayed_session_drains_and_exports_history() {
    let dir = tempfile::tempdir().unwrap();
    let frames = (0..20u64).map(|n| Frame::gray(16, 16, 0).with_sequence(n).at(n as i64 * 33));
    let poses = ReplayPoseSource::from_frames(
        (0..20)
            .map(|n| {
                vec![Ok(Detection::new(
                    EntityId::marker(3),
                    Entity::Marker(Pose::new(Vec3::new(n as f64 * 0.1, 0.0, 1.0), Vec3::ZERO)),
                ))]
            })
            .collect(),
    );
    let mut settings = PipelineSettings::default();
    settings.acquisition.capture_interval = std::time::Duration::from_millis(2);
    settings.orchestrator.history_dir = dir.path().to_path_buf();
    let services = PipelineServices::new(ProfileStore::new(EntityProfiles::default()));

    let report = run_pipeline_once(
        Box::new(MemorySource::new(frames)),
        Box::new(poses),
        &settings,
        &services,
        0,
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert_eq!(report.outcome, PipelineOutcome::Graceful);
    assert_eq!(report.orchestrator, OrchestratorExit::Drained);
    assert_eq!(report.acquisition.captured, 20);

    let exported: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(exported.len(), 1);
    let name = exported[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("design_history_") && name.ends_with(".json"));

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&exported[0]).unwrap()).unwrap();
    let entries = json["3"].as_object().unwrap();
    assert!(!entries.is_empty());
    let first = entries.values().next().unwrap();
    assert_eq!(first["width"], "256px");
    assert_eq!(first["pos-rot"]["s"], 0.1);
}
