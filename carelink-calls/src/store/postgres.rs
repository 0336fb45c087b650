use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use carelink_shared::clients::db::DbPool;
use carelink_shared::errors::{AppError, AppResult};

use super::CallSessionStore;
use crate::models::CallSession;
use crate::schema::call_sessions;

#[derive(Debug, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = call_sessions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(treat_none_as_null = true)]
struct CallSessionRow {
    id: Uuid,
    appointment_id: String,
    doctor_id: String,
    doctor_identity: String,
    patient_id: String,
    patient_identity: String,
    call_type: String,
    status: String,
    initiator_role: String,
    offer_sdp: Option<String>,
    answer_sdp: Option<String>,
    ice_servers: serde_json::Value,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    end_reason: Option<String>,
    network_type: Option<String>,
    device_info: Option<String>,
    version: i64,
}

impl TryFrom<&CallSession> for CallSessionRow {
    type Error = AppError;

    fn try_from(s: &CallSession) -> AppResult<Self> {
        let ice_servers = serde_json::to_value(&s.ice_servers)
            .map_err(|e| AppError::internal(format!("failed to encode ICE servers: {e}")))?;
        Ok(Self {
            id: s.id,
            appointment_id: s.appointment_id.clone(),
            doctor_id: s.doctor_id.clone(),
            doctor_identity: s.doctor_identity.clone(),
            patient_id: s.patient_id.clone(),
            patient_identity: s.patient_identity.clone(),
            call_type: s.call_type.as_str().to_string(),
            status: s.status.as_str().to_string(),
            initiator_role: s.initiator_role.as_str().to_string(),
            offer_sdp: s.offer_sdp.clone(),
            answer_sdp: s.answer_sdp.clone(),
            ice_servers,
            created_at: s.created_at,
            started_at: s.started_at,
            ended_at: s.ended_at,
            duration_seconds: s.duration_seconds,
            end_reason: s.end_reason.map(|r| r.as_str().to_string()),
            network_type: s.network_type.clone(),
            device_info: s.device_info.clone(),
            version: s.version,
        })
    }
}

impl TryFrom<CallSessionRow> for CallSession {
    type Error = AppError;

    fn try_from(row: CallSessionRow) -> AppResult<Self> {
        let corrupt = |field: &str, e: String| {
            AppError::internal(format!("call session {} has invalid {field}: {e}", row.id))
        };
        Ok(Self {
            id: row.id,
            call_type: row.call_type.parse().map_err(|e| corrupt("call_type", e))?,
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            initiator_role: row.initiator_role.parse().map_err(|e| corrupt("initiator_role", e))?,
            end_reason: row
                .end_reason
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|e| corrupt("end_reason", e))?,
            ice_servers: serde_json::from_value(row.ice_servers.clone())
                .map_err(|e| corrupt("ice_servers", e.to_string()))?,
            appointment_id: row.appointment_id,
            doctor_id: row.doctor_id,
            doctor_identity: row.doctor_identity,
            patient_id: row.patient_id,
            patient_identity: row.patient_identity,
            offer_sdp: row.offer_sdp,
            answer_sdp: row.answer_sdp,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds,
            network_type: row.network_type,
            device_info: row.device_info,
            version: row.version,
        })
    }
}

/// Postgres-backed store. Diesel is synchronous, so every query runs on the blocking pool.
#[derive(Clone)]
pub struct PgCallSessionStore {
    pool: DbPool,
}

impl PgCallSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> AppResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| AppError::internal(format!("database connection error: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| AppError::internal(format!("database task failed: {e}")))?
    }
}

fn rows_to_sessions(rows: Vec<CallSessionRow>) -> AppResult<Vec<CallSession>> {
    rows.into_iter().map(CallSession::try_from).collect()
}

#[async_trait]
impl CallSessionStore for PgCallSessionStore {
    async fn insert(&self, session: &CallSession) -> AppResult<()> {
        let row = CallSessionRow::try_from(session)?;
        self.with_conn(move |conn| {
            diesel::insert_into(call_sessions::table)
                .values(&row)
                .execute(conn)
                .map_err(AppError::Database)?;
            Ok(())
        })
        .await
    }

    async fn find(&self, id: Uuid) -> AppResult<Option<CallSession>> {
        let row = self
            .with_conn(move |conn| {
                call_sessions::table
                    .find(id)
                    .select(CallSessionRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(AppError::Database)
            })
            .await?;
        row.map(CallSession::try_from).transpose()
    }

    async fn find_live_by_appointment(&self, appointment_id: &str) -> AppResult<Option<CallSession>> {
        let appointment_id = appointment_id.to_string();
        let live: Vec<&'static str> = crate::models::CallStatus::LIVE
            .iter()
            .map(|s| s.as_str())
            .collect();
        let row = self
            .with_conn(move |conn| {
                call_sessions::table
                    .filter(call_sessions::appointment_id.eq(appointment_id))
                    .filter(call_sessions::status.eq_any(live))
                    .order((call_sessions::created_at.desc(), call_sessions::id.desc()))
                    .select(CallSessionRow::as_select())
                    .first(conn)
                    .optional()
                    .map_err(AppError::Database)
            })
            .await?;
        row.map(CallSession::try_from).transpose()
    }

    async fn list_by_participant(&self, identity: &str, offset: i64, limit: i64) -> AppResult<Vec<CallSession>> {
        let identity = identity.to_string();
        let rows = self
            .with_conn(move |conn| {
                call_sessions::table
                    .filter(
                        call_sessions::doctor_identity
                            .eq(&identity)
                            .or(call_sessions::patient_identity.eq(&identity)),
                    )
                    .order((call_sessions::created_at.desc(), call_sessions::id.desc()))
                    .offset(offset)
                    .limit(limit)
                    .select(CallSessionRow::as_select())
                    .load(conn)
                    .map_err(AppError::Database)
            })
            .await?;
        rows_to_sessions(rows)
    }

    async fn update_versioned(&self, session: &CallSession) -> AppResult<bool> {
        let expected = session.version;
        let mut row = CallSessionRow::try_from(session)?;
        row.version = expected + 1;
        let updated = self
            .with_conn(move |conn| {
                diesel::update(
                    call_sessions::table
                        .filter(call_sessions::id.eq(row.id))
                        .filter(call_sessions::version.eq(expected)),
                )
                .set(&row)
                .execute(conn)
                .map_err(AppError::Database)
            })
            .await?;
        Ok(updated == 1)
    }
}
