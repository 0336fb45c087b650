use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use carelink_shared::errors::{AppError, AppResult};

use super::CallSessionStore;
use crate::models::CallSession;

/// Process-local store used in development and tests.
#[derive(Debug, Default)]
pub struct MemoryCallSessionStore {
    sessions: DashMap<Uuid, CallSession>,
}

impl MemoryCallSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallSessionStore for MemoryCallSessionStore {
    async fn insert(&self, session: &CallSession) -> AppResult<()> {
        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => Err(AppError::internal(format!(
                "call session {} already exists",
                session.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, id: Uuid) -> AppResult<Option<CallSession>> {
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    async fn find_live_by_appointment(&self, appointment_id: &str) -> AppResult<Option<CallSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.appointment_id == appointment_id && s.status.is_live())
            .max_by_key(|s| (s.created_at, s.id))
            .map(|s| s.value().clone()))
    }

    async fn list_by_participant(&self, identity: &str, offset: i64, limit: i64) -> AppResult<Vec<CallSession>> {
        let mut sessions: Vec<CallSession> = self
            .sessions
            .iter()
            .filter(|s| s.is_participant(identity))
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(sessions
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn update_versioned(&self, session: &CallSession) -> AppResult<bool> {
        let Some(mut stored) = self.sessions.get_mut(&session.id) else {
            return Ok(false);
        };
        if stored.version != session.version {
            return Ok(false);
        }
        *stored = CallSession {
            version: session.version + 1,
            ..session.clone()
        };
        Ok(true)
    }
}
