use std::sync::Arc;

use carelink_calls::clients::appointments::HttpAppointmentDirectory;
use carelink_calls::config::AppConfig;
use carelink_calls::events::publisher::{CallEventPublisher, LogCallEventPublisher, RabbitCallEventPublisher};
use carelink_calls::services::call_service::CallService;
use carelink_calls::services::turn_credentials::TurnCredentialIssuer;
use carelink_calls::signaling::SignalingHub;
use carelink_calls::store::{CallSessionStore, MemoryCallSessionStore, PgCallSessionStore};
use carelink_calls::{build_router, AppState};
use carelink_shared::clients::db::create_pool;
use carelink_shared::clients::rabbitmq::RabbitMQClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    carelink_shared::middleware::init_tracing("carelink-calls");

    let config = AppConfig::load()?;
    config.log_summary();
    let port = config.port;

    let metrics = carelink_shared::middleware::init_metrics()?;
    let verifier = config.token_verifier()?;

    // Call session store
    let db = match config.database_url.as_deref() {
        Some(url) => Some(create_pool(url, config.db_pool_size)?),
        None => {
            tracing::warn!("no database configured, call sessions are kept in memory");
            None
        }
    };
    let store: Arc<dyn CallSessionStore> = match &db {
        Some(pool) => Arc::new(PgCallSessionStore::new(pool.clone())),
        None => Arc::new(MemoryCallSessionStore::new()),
    };

    // Event publishing
    let rabbitmq = match config.rabbitmq_url.as_deref() {
        Some(url) => Some(RabbitMQClient::connect(url).await?),
        None => None,
    };
    let events: Arc<dyn CallEventPublisher> = match &rabbitmq {
        Some(client) => Arc::new(RabbitCallEventPublisher::new(client.clone())),
        None => Arc::new(LogCallEventPublisher),
    };

    let appointments = Arc::new(HttpAppointmentDirectory::new(&config.appointment_service_url)?);
    let turn = TurnCredentialIssuer::new(
        &config.turn_secret,
        &config.turn_domain,
        config.turn_credential_ttl_secs,
    )
    .map_err(|e| anyhow::anyhow!("invalid TURN secret: {e}"))?;

    let calls = CallService::new(store, appointments, turn, events);

    let state = Arc::new(AppState {
        config,
        verifier,
        calls,
        hub: SignalingHub::new(),
        db,
        rabbitmq,
        metrics: Some(metrics),
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "carelink-calls starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
