use std::time::Duration;

use serde::Deserialize;

use carelink_shared::auth::TokenVerifier;
use carelink_shared::errors::AppResult;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Postgres URL. Unset means sessions live in process memory only.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,
    /// Broker URL for call events. Unset means events are only logged.
    #[serde(default)]
    pub rabbitmq_url: Option<String>,
    #[serde(default = "default_appointment_service_url")]
    pub appointment_service_url: String,

    // Token verification
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    /// RS256 public key of the identity provider; takes precedence over `jwt_secret`.
    #[serde(default)]
    pub jwt_public_key_pem: Option<String>,
    #[serde(default)]
    pub jwt_issuer: Option<String>,
    #[serde(default)]
    pub jwt_audience: Option<String>,

    // TURN relay credentials
    #[serde(default = "default_turn_domain")]
    pub turn_domain: String,
    #[serde(default = "default_turn_secret")]
    pub turn_secret: String,
    #[serde(default = "default_turn_credential_ttl_secs")]
    pub turn_credential_ttl_secs: u64,

    // Signaling transport
    #[serde(default = "default_ws_max_message_bytes")]
    pub ws_max_message_bytes: usize,
    /// A connection with no inbound frame (pongs included) for this long is closed.
    #[serde(default = "default_ws_idle_timeout_secs")]
    pub ws_idle_timeout_secs: u64,
    /// Server pings keep a quiet but healthy call above the idle timeout.
    #[serde(default = "default_ws_ping_interval_secs")]
    pub ws_ping_interval_secs: u64,
    #[serde(default = "default_ws_outbound_buffer")]
    pub ws_outbound_buffer: usize,
}

fn default_port() -> u16 { 3010 }
fn default_db_pool_size() -> u32 { 10 }
fn default_appointment_service_url() -> String { "http://localhost:8083".into() }
fn default_jwt_secret() -> String { "development-secret-change-in-production".into() }
fn default_turn_domain() -> String { "turn.carelink.local".into() }
fn default_turn_secret() -> String { "development-turn-secret".into() }
fn default_turn_credential_ttl_secs() -> u64 { 86_400 }
fn default_ws_max_message_bytes() -> usize { 64 * 1024 }
fn default_ws_idle_timeout_secs() -> u64 { 300 }
fn default_ws_ping_interval_secs() -> u64 { 30 }
fn default_ws_outbound_buffer() -> usize { 256 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_url: None,
            db_pool_size: default_db_pool_size(),
            rabbitmq_url: None,
            appointment_service_url: default_appointment_service_url(),
            jwt_secret: default_jwt_secret(),
            jwt_public_key_pem: None,
            jwt_issuer: None,
            jwt_audience: None,
            turn_domain: default_turn_domain(),
            turn_secret: default_turn_secret(),
            turn_credential_ttl_secs: default_turn_credential_ttl_secs(),
            ws_max_message_bytes: default_ws_max_message_bytes(),
            ws_idle_timeout_secs: default_ws_idle_timeout_secs(),
            ws_ping_interval_secs: default_ws_ping_interval_secs(),
            ws_outbound_buffer: default_ws_outbound_buffer(),
        }
    }
}

impl AppConfig {
    /// Load from `CARELINK_CALLS__*` environment variables (and `.env` if present).
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CARELINK_CALLS").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn token_verifier(&self) -> AppResult<TokenVerifier> {
        let mut verifier = match self.jwt_public_key_pem.as_deref() {
            Some(pem) if !pem.trim().is_empty() => TokenVerifier::rs256_pem(pem)?,
            _ => TokenVerifier::hs256(&self.jwt_secret),
        };
        if let Some(issuer) = self.jwt_issuer.as_deref() {
            verifier = verifier.with_issuer(issuer);
        }
        if let Some(audience) = self.jwt_audience.as_deref() {
            verifier = verifier.with_audience(audience);
        }
        Ok(verifier)
    }

    pub fn ws_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_idle_timeout_secs.max(1))
    }

    /// Ping period, kept at or under half the idle timeout so a responsive client never idles out.
    pub fn ws_ping_interval(&self) -> Duration {
        let idle = self.ws_idle_timeout();
        Duration::from_secs(self.ws_ping_interval_secs.max(1)).min(idle / 2)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            port = self.port,
            store = if self.database_url.is_some() { "postgres" } else { "memory" },
            events = if self.rabbitmq_url.is_some() { "rabbitmq" } else { "log-only" },
            appointment_service = %self.appointment_service_url,
            jwt = if self.jwt_public_key_pem.is_some() { "RS256" } else { "HS256" },
            turn_domain = %self.turn_domain,
            turn_ttl_secs = self.turn_credential_ttl_secs,
            ws_max_message_bytes = self.ws_max_message_bytes,
            ws_idle_timeout_secs = self.ws_idle_timeout_secs,
            ws_ping_interval_secs = self.ws_ping_interval_secs,
            "configuration loaded"
        );
    }
}
