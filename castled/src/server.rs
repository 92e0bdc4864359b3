//! The admin HTTP API.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{AddExtensionLayer, Router};
use futures::prelude::*;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::{RefreshEvent, RefreshReason};
use crate::config::Config;
use crate::context::Services;
use crate::election::LeaderState;
use crate::error::{AppError, AppErrorExt};
use crate::{mds, rgw};

/// The body of a file system creation request.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct FilesystemRequest {
    pub name: String,
    pub pool: String,
}

/// The body of a health response.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct HealthResponse {
    pub node_id: String,
    pub leading: bool,
}

/// State shared by every handler.
struct ApiState {
    services: Arc<Services>,
    events_tx: mpsc::Sender<RefreshEvent>,
    leader_state: watch::Receiver<LeaderState>,
}

/// The admin API server.
pub struct AdminServer {
    config: Arc<Config>,
    state: Arc<ApiState>,
    shutdown: broadcast::Sender<()>,
}

impl AdminServer {
    pub fn new(services: Arc<Services>, events_tx: mpsc::Sender<RefreshEvent>, leader_state: watch::Receiver<LeaderState>) -> Self {
        Self {
            config: services.config.clone(),
            shutdown: services.shutdown_tx.clone(),
            state: Arc::new(ApiState {
                services,
                events_tx,
                leader_state,
            }),
        }
    }

    /// Spawn the server. An error from the server triggers a shutdown of the daemon.
    pub fn spawn(self) -> JoinHandle<()> {
        let app = Router::new()
            .route("/health", get(health))
            .route("/filesystems", post(create_filesystem))
            .route("/filesystems/:name", delete(delete_filesystem))
            .route("/objectstore", post(create_object_store).delete(delete_object_store))
            .route("/refresh", post(refresh))
            .layer(AddExtensionLayer::new(self.state));
        let mut shutdown_rx = self.shutdown.subscribe();
        let server = axum::Server::bind(&([0, 0, 0, 0], self.config.admin_port).into())
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            });
        tracing::info!("admin server is listening at 0.0.0.0:{}", self.config.admin_port);
        let shutdown = self.shutdown;
        tokio::spawn(server.map(move |res| {
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from admin server, shutting down");
                let _res = shutdown.send(());
            }
        }))
    }
}

/// Map the outcome of an admin operation onto a response.
fn respond(res: Result<()>, success: StatusCode) -> (StatusCode, String) {
    match res {
        Ok(()) => (success, String::new()),
        Err(err) => {
            tracing::error!(error = ?err, "admin request failed");
            AppError::http(err)
        }
    }
}

async fn health(Extension(state): Extension<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        node_id: state.services.config.node_id.clone(),
        leading: matches!(*state.leader_state.borrow(), LeaderState::Leading),
    })
}

async fn create_filesystem(Extension(state): Extension<Arc<ApiState>>, Json(req): Json<FilesystemRequest>) -> (StatusCode, String) {
    tracing::debug!(filesystem = %req.name, pool = %req.pool, "create file system requested");
    let config = &state.services.config;
    respond(
        mds::add_filesystem(state.services.kvs.as_ref(), &config.cluster_name, &req.name, &req.pool).await,
        StatusCode::CREATED,
    )
}

async fn delete_filesystem(Extension(state): Extension<Arc<ApiState>>, Path(name): Path<String>) -> (StatusCode, String) {
    tracing::debug!(filesystem = %name, "delete file system requested");
    let config = &state.services.config;
    respond(
        mds::remove_filesystem(state.services.kvs.as_ref(), &config.cluster_name, &name).await,
        StatusCode::NO_CONTENT,
    )
}

async fn create_object_store(Extension(state): Extension<Arc<ApiState>>) -> (StatusCode, String) {
    let config = &state.services.config;
    respond(rgw::enable_object_store(state.services.kvs.as_ref(), &config.cluster_name).await, StatusCode::CREATED)
}

async fn delete_object_store(Extension(state): Extension<Arc<ApiState>>) -> (StatusCode, String) {
    let config = &state.services.config;
    respond(rgw::remove_object_store(state.services.kvs.as_ref(), &config.cluster_name).await, StatusCode::NO_CONTENT)
}

async fn refresh(Extension(state): Extension<Arc<ApiState>>) -> (StatusCode, String) {
    // Only the leader runs passes, a follower would drop the event.
    let leader_state = state.leader_state.borrow().clone();
    match leader_state {
        LeaderState::Leading => (),
        LeaderState::Following(leader) => return (StatusCode::CONFLICT, format!("not the leader, send refreshes to node {}", leader)),
        LeaderState::Standby => return (StatusCode::CONFLICT, "no leader elected yet".into()),
    }
    let res = state
        .events_tx
        .send(RefreshEvent::new(RefreshReason::Manual))
        .await
        .map_err(|_| anyhow::anyhow!("refresh channel closed"));
    respond(res, StatusCode::ACCEPTED)
}
