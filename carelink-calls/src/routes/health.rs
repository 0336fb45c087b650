use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use carelink_shared::types::api::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = match &state.db {
        Some(pool) => {
            let pool_state = pool.state();
            let status = if pool_state.connections > 0 { HealthStatus::Healthy } else { HealthStatus::Unhealthy };
            HealthCheck::new("postgres", status).with_message(format!(
                "{} connections, {} idle",
                pool_state.connections, pool_state.idle_connections
            ))
        }
        None => HealthCheck::new("store", HealthStatus::Healthy).with_message("in-memory"),
    };

    let broker = match &state.rabbitmq {
        Some(client) if client.is_connected() => HealthCheck::new("rabbitmq", HealthStatus::Healthy),
        Some(_) => HealthCheck::new("rabbitmq", HealthStatus::Degraded).with_message("channel closed"),
        None => HealthCheck::new("rabbitmq", HealthStatus::Healthy).with_message("not configured, events are logged"),
    };

    let signaling = HealthCheck::new("signaling", HealthStatus::Healthy)
        .with_message(format!("{} active rooms", state.hub.room_count()));

    Json(
        HealthResponse::healthy("carelink-calls", env!("CARGO_PKG_VERSION"))
            .with_checks(vec![store, broker, signaling]),
    )
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
