use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use carelink_shared::auth::TokenVerifier;
use carelink_shared::clients::db::DbPool;
use carelink_shared::clients::rabbitmq::RabbitMQClient;
use carelink_shared::middleware::{metrics_middleware, HasTokenVerifier};

pub mod clients;
pub mod config;
pub mod events;
pub mod models;
pub mod routes;
pub mod schema;
pub mod services;
pub mod signaling;
pub mod store;

use crate::config::AppConfig;
use crate::services::call_service::CallService;
use crate::signaling::SignalingHub;

pub struct AppState {
    pub config: AppConfig,
    pub verifier: TokenVerifier,
    pub calls: CallService,
    pub hub: SignalingHub,
    pub db: Option<DbPool>,
    pub rabbitmq: Option<RabbitMQClient>,
    pub metrics: Option<PrometheusHandle>,
}

impl HasTokenVerifier for AppState {
    fn token_verifier(&self) -> &TokenVerifier {
        &self.verifier
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/initiate", post(routes::calls::initiate_call))
        .route("/ice-servers", get(routes::ice::get_ice_servers))
        .route("/calls/history", get(routes::calls::call_history))
        .route(
            "/calls/appointment/:appointment_id",
            get(routes::calls::get_call_by_appointment),
        )
        .route("/calls/:call_id", get(routes::calls::get_call))
        .route("/calls/:call_id/offer", post(routes::calls::save_offer))
        .route("/calls/:call_id/answer", post(routes::calls::save_answer))
        .route("/calls/:call_id/active", post(routes::calls::mark_active))
        .route("/calls/:call_id/end", post(routes::calls::end_call))
        .route("/calls/:call_id/quality", get(routes::calls::get_call_quality));

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .route("/ws/webrtc/:call_id", get(signaling::gateway::ws_handler))
        .nest("/api/webrtc", api)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
