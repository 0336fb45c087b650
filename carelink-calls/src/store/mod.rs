mod memory;
mod postgres;

pub use memory::MemoryCallSessionStore;
pub use postgres::PgCallSessionStore;

use async_trait::async_trait;
use uuid::Uuid;

use carelink_shared::errors::AppResult;

use crate::models::CallSession;

/// Persistence for call sessions. Only the lifecycle manager writes through it.
#[async_trait]
pub trait CallSessionStore: Send + Sync {
    async fn insert(&self, session: &CallSession) -> AppResult<()>;

    async fn find(&self, id: Uuid) -> AppResult<Option<CallSession>>;

    /// Most recently created session for the appointment that is still live.
    async fn find_live_by_appointment(&self, appointment_id: &str) -> AppResult<Option<CallSession>>;

    /// Sessions where `identity` is the doctor or the patient, newest first.
    async fn list_by_participant(&self, identity: &str, offset: i64, limit: i64) -> AppResult<Vec<CallSession>>;

    /// Write `session` only if the stored version still equals `session.version`.
    /// On success the stored version is incremented; `Ok(false)` means someone else won.
    async fn update_versioned(&self, session: &CallSession) -> AppResult<bool>;
}
