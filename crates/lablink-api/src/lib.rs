//! HTTP API over the coordinator.
//!
//! Thin REST surface for dashboards and scripts: fleet snapshot, device
//! removal, command submission and in-flight observability. Command
//! submission is asynchronous by design: the endpoint returns the
//! `req_id` and the reply topic; outcomes arrive on the capability's
//! reply path.

mod handlers;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use lablink_coordinator::Coordinator;
use lablink_core::{Error, ErrorCode};

/// Build the API router around a running coordinator.
pub fn create_router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/registry", get(handlers::registry_snapshot))
        .route(
            "/api/registry/devices/:device_id",
            delete(handlers::remove_device),
        )
        .route(
            "/api/capabilities/:capability/cmd",
            post(handlers::submit_command),
        )
        .route("/api/requests", get(handlers::pending_requests))
        .route("/api/leases", get(handlers::active_leases))
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

/// Bind and serve the API until the process exits.
pub async fn serve(coordinator: Coordinator, addr: &str) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "api listening");
    axum::serve(listener, create_router(coordinator))
        .await
        .map_err(|e| Error::Network(format!("api server: {}", e)))
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
}

/// Coordinator error adapted to an HTTP response.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::DeviceNotFound | ErrorCode::ModuleNotAvailable => StatusCode::NOT_FOUND,
            ErrorCode::InvalidParams => StatusCode::BAD_REQUEST,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::ResourceBusy => StatusCode::CONFLICT,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::NetworkError => StatusCode::BAD_GATEWAY,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
                code,
            }),
        )
            .into_response()
    }
}
