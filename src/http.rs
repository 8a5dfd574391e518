//! HTTP control plane.
//!
//! Jobs are declared and removed here; the handlers only publish new
//! entries, the actual work happens once the entry is merged.  Listing
//! endpoints read the store and never change it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use log::{info, warn};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

use crate::gossip::{Peers, PublishError, Publisher};
use crate::store::Store;
use crate::types::{MeshEntry, TargetGroup};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub publisher: Publisher,
    pub registry: Registry,
    pub peers: Peers,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/cluster", get(cluster))
        .route("/snapshot", get(snapshot))
        .route("/jobs", get(list_jobs))
        .route(
            "/jobs/{name}",
            get(get_job).post(add_job).delete(remove_job),
        )
        .with_state(state)
}

/// Start the HTTP server.
pub async fn run_http_server(listen: SocketAddr, state: AppState) -> anyhow::Result<()> {
    info!("HTTP server starting on {}", listen);

    let listener = TcpListener::bind(listen).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&state.registry.gather(), &mut buf) {
        warn!("Encode metrics failed: {}", err);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response()
}

async fn cluster(State(state): State<AppState>) -> Json<Vec<String>> {
    let peers = state.peers.read().await;
    Json(peers.iter().map(|peer| peer.to_string()).collect())
}

async fn snapshot(State(state): State<AppState>) -> Json<Vec<MeshEntry>> {
    let entries = state.store.snapshot().await;
    Json(entries.iter().map(|entry| entry.as_ref().clone()).collect())
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.job_names().await)
}

async fn get_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MeshEntry>, StatusCode> {
    match state.store.get(&name).await {
        Some(entry) => Ok(Json(entry.as_ref().clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn add_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let group = match serde_json::from_slice::<TargetGroup>(&body) {
        Ok(group) => group,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let entry = MeshEntry::active(name, Utc::now(), group);
    match state.publisher.publish(&entry).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            warn!("Add job {} failed: {}", entry.name, err);
            (publish_status(&err), err.to_string()).into_response()
        }
    }
}

async fn remove_job(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    let entry = MeshEntry::inactive(name, Utc::now());
    match state.publisher.publish(&entry).await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!("Remove job {} failed: {}", entry.name, err);
            publish_status(&err)
        }
    }
}

fn publish_status(err: &PublishError) -> StatusCode {
    match err {
        // the local clock is behind whoever wrote the stored entry
        PublishError::Stale(_) => StatusCode::CONFLICT,
        PublishError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PublishError::Closed => StatusCode::SERVICE_UNAVAILABLE,
    }
}
