//! Actix Web listener for live consumers and operator endpoints.
//!
//! The server runs on a dedicated thread to keep the pipeline hot path free
//! from Actix runtime concerns. Each `/stream` connection registers a channel
//! consumer for its lifetime.

use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::Arc,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::pipeline::{
    broadcast::{ChannelConsumer, ConsumerLease, ConsumerRegistry},
    history::HistoryRecorder,
    profiles::ProfileStore,
    telemetry,
};

/// Restart bookkeeping surfaced on `/health`.
#[derive(Default)]
pub struct PipelineStatus {
    restarts: Mutex<(u32, Option<String>)>,
}

impl PipelineStatus {
    pub fn record_restart(&self, reason: impl Into<String>) {
        let mut guard = self.restarts.lock();
        guard.0 += 1;
        guard.1 = Some(reason.into());
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.lock().0
    }

    pub fn last_restart_reason(&self) -> Option<String> {
        self.restarts.lock().1.clone()
    }
}

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: ConsumerRegistry,
    pub recorder: HistoryRecorder,
    pub profiles: ProfileStore,
    pub history_dir: PathBuf,
    pub consumer_buffer: usize,
    pub status: Arc<PipelineStatus>,
}

/// Handle for the listener thread.
#[derive(Default)]
pub struct ConsumerServer {
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ConsumerServer {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Bind `addr` and serve on a background thread.
///
/// Binding happens on the caller's thread so an unusable address is reported
/// immediately.
pub fn spawn_consumer_server(addr: SocketAddr, context: ServerContext) -> Result<ConsumerServer> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("Failed to bind consumer listener on {addr}"))?;
    let local_addr = listener.local_addr().ok();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = telemetry::spawn_thread("tracker-consumer-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(context.clone()))
                    .route("/stream", web::get().to(stream_handler))
                    .route("/health", web::get().to(health_handler))
                    .route("/metrics", web::get().to(metrics_handler))
                    .route("/admin/export-history", web::post().to(export_handler))
                    .route("/admin/reload-config", web::post().to(reload_handler))
            })
            .workers(1)
            .listen(listener)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(false).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn consumer server thread")?;

    Ok(ConsumerServer {
        local_addr,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Stream tracking updates as Server-Sent Events.
async fn stream_handler(state: web::Data<ServerContext>) -> HttpResponse {
    let (tx, mut rx) = mpsc::channel::<Bytes>(state.consumer_buffer.max(1));
    let registry = state.registry.clone();
    let id = registry.register(Arc::new(ChannelConsumer::new("sse", tx)));
    info!("Consumer {id} connected ({} total)", registry.len());
    let lease = ConsumerLease::new(registry, id);

    let stream = stream! {
        let _lease = lease;
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        while let Some(payload) = rx.recv().await {
            let mut chunk = Vec::with_capacity(payload.len() + 40);
            chunk.extend_from_slice(b"event: tracking_update\ndata: ");
            chunk.extend_from_slice(&payload);
            chunk.extend_from_slice(b"\n\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

#[derive(Serialize)]
struct HealthResponse {
    consumers: usize,
    history_frames: u64,
    history_entries: usize,
    tracked_entities: Vec<String>,
    restarts: u32,
    last_restart_reason: Option<String>,
}

async fn health_handler(state: web::Data<ServerContext>) -> HttpResponse {
    let recorder = &state.recorder;
    HttpResponse::Ok().json(HealthResponse {
        consumers: state.registry.len(),
        history_frames: recorder.next_index(),
        history_entries: recorder.total_entries(),
        tracked_entities: recorder
            .entity_ids()
            .iter()
            .map(ToString::to_string)
            .collect(),
        restarts: state.status.restarts(),
        last_restart_reason: state.status.last_restart_reason(),
    })
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

async fn export_handler(state: web::Data<ServerContext>) -> HttpResponse {
    let recorder = state.recorder.clone();
    let dir = state.history_dir.clone();
    match web::block(move || recorder.export(&dir)).await {
        Ok(Ok(path)) => HttpResponse::Ok().json(serde_json::json!({
            "path": path.display().to_string(),
        })),
        Ok(Err(err)) => {
            warn!("Export error: {err}");
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": err.to_string() }))
        }
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": err.to_string() })),
    }
}

async fn reload_handler(state: web::Data<ServerContext>) -> HttpResponse {
    let profiles = state.profiles.clone();
    match web::block(move || profiles.reload()).await {
        Ok(Ok(count)) => HttpResponse::Ok().json(serde_json::json!({ "profiles": count })),
        Ok(Err(err)) => {
            warn!("Config reload failed: {err}");
            HttpResponse::BadRequest().json(serde_json::json!({ "error": err.to_string() }))
        }
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({ "error": err.to_string() })),
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test;
    use pose_core::{Entity, EntityId, Pose, Vec3};

    use super::*;
    use crate::pipeline::{data::EntityMap, profiles::EntityProfiles};

    fn context(history_dir: PathBuf) -> ServerContext {
        let profiles = ProfileStore::new(EntityProfiles::default());
        ServerContext {
            registry: ConsumerRegistry::new(),
            recorder: HistoryRecorder::new(profiles.clone()),
            profiles,
            history_dir,
            consumer_buffer: 4,
            status: Arc::new(PipelineStatus::default()),
        }
    }

    #[actix_web::test]
    async fn health_reports_consumers_and_history() {
        let state = context(PathBuf::from("unused"));
        state.status.record_restart("processing");
        let seen: EntityMap = [(
            EntityId::from("7"),
            Entity::Marker(Pose::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ZERO)),
        )]
        .into_iter()
        .collect();
        state.recorder.record(&seen, &EntityMap::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_handler)),
        )
        .await;
        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request())
                .await;
        assert_eq!(body["consumers"], 0);
        assert_eq!(body["history_frames"], 1);
        assert_eq!(body["history_entries"], 1);
        assert_eq!(body["tracked_entities"], serde_json::json!(["7"]));
        assert_eq!(body["restarts"], 1);
        assert_eq!(body["last_restart_reason"], "processing");
    }

    #[actix_web::test]
    async fn export_endpoint_writes_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(context(dir.path().to_path_buf())))
                .route("/admin/export-history", web::post().to(export_handler)),
        )
        .await;
        let response = test::call_service(
            &app,
            test::TestRequest::post().uri("/admin/export-history").to_request(),
        )
        .await;
        assert!(response.status().is_success());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[actix_web::test]
    async fn reload_without_profile_file_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(context(PathBuf::from("unused"))))
                .route("/admin/reload-config", web::post().to(reload_handler)),
        )
        .await;
        let response = test::call_service(
            &app,
            test::TestRequest::post().uri("/admin/reload-config").to_request(),
        )
        .await;
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn stream_registers_until_the_body_is_dropped() {
        let state = context(PathBuf::from("unused"));
        let registry = state.registry.clone();
        let response = stream_handler(web::Data::new(state)).await;
        assert_eq!(registry.len(), 1);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        drop(response);
        assert!(registry.is_empty());
    }
}
