//! Endpoint handlers and DTOs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use lablink_coordinator::{Coordinator, Device, Lease, PendingRequest, StatusCounts};
use lablink_core::envelope::{Actor, Envelope};

use crate::ApiError;

/// Fleet snapshot plus the coordinator's registered capabilities.
#[derive(Debug, Serialize)]
pub struct RegistryResponse {
    pub ts: DateTime<Utc>,
    pub devices: BTreeMap<String, Device>,
    pub counts: StatusCounts,
    pub capabilities: Vec<String>,
}

/// Body for `POST /api/capabilities/{capability}/cmd`.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Defaults to `api`.
    #[serde(default)]
    pub actor: Option<Actor>,
}

/// Accepted command: the outcome arrives on `reply_topic` under `req_id`.
#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    pub req_id: Uuid,
    pub reply_topic: String,
}

pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": lablink_core::VERSION,
    }))
}

pub async fn registry_snapshot(State(coordinator): State<Coordinator>) -> Json<RegistryResponse> {
    let snapshot = coordinator.registry().snapshot().await;
    Json(RegistryResponse {
        ts: snapshot.ts,
        devices: snapshot.devices,
        counts: snapshot.counts,
        capabilities: coordinator.router().capabilities().await,
    })
}

pub async fn remove_device(
    State(coordinator): State<Coordinator>,
    Path(device_id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let device = coordinator.remove_device(&device_id).await?;
    Ok(Json(device))
}

pub async fn submit_command(
    State(coordinator): State<Coordinator>,
    Path(capability): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<(StatusCode, Json<CommandAccepted>), ApiError> {
    let envelope = Envelope::command(
        request.actor.unwrap_or(Actor::Api),
        request.action,
        request.params,
    );
    let req_id = coordinator.submit_command(&capability, envelope).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            req_id,
            reply_topic: coordinator.topics().coordinator_evt(&capability),
        }),
    ))
}

pub async fn pending_requests(
    State(coordinator): State<Coordinator>,
) -> Json<Vec<PendingRequest>> {
    Json(coordinator.correlator().pending().await)
}

pub async fn active_leases(State(coordinator): State<Coordinator>) -> Json<Vec<Lease>> {
    Json(coordinator.leases().active().await)
}
