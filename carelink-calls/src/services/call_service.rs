use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::sync::Mutex;
use uuid::Uuid;

use carelink_shared::errors::{AppError, AppResult, ErrorCode};
use carelink_shared::types::auth::AuthUser;
use carelink_shared::types::pagination::PaginationParams;

use crate::clients::appointments::AppointmentDirectory;
use crate::events::publisher::CallEventPublisher;
use crate::models::{CallQos, CallQuality, CallSession, CallType, EndReason, InitiatorRole};
use crate::services::turn_credentials::TurnCredentialIssuer;
use crate::store::CallSessionStore;

const MAX_UPDATE_ATTEMPTS: usize = 5;
const INITIATE_LOCK_STRIPES: usize = 32;

/// Session lifecycle manager: the only writer of call sessions.
pub struct CallService {
    store: Arc<dyn CallSessionStore>,
    appointments: Arc<dyn AppointmentDirectory>,
    turn: TurnCredentialIssuer,
    events: Arc<dyn CallEventPublisher>,
    // Serialises "look up live session, then create" per appointment within this process.
    initiate_locks: Vec<Mutex<()>>,
}

impl CallService {
    pub fn new(
        store: Arc<dyn CallSessionStore>,
        appointments: Arc<dyn AppointmentDirectory>,
        turn: TurnCredentialIssuer,
        events: Arc<dyn CallEventPublisher>,
    ) -> Self {
        Self {
            store,
            appointments,
            turn,
            events,
            initiate_locks: (0..INITIATE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn turn(&self) -> &TurnCredentialIssuer {
        &self.turn
    }

    fn initiate_lock(&self, appointment_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        appointment_id.hash(&mut hasher);
        let stripe = (hasher.finish() % INITIATE_LOCK_STRIPES as u64) as usize;
        &self.initiate_locks[stripe]
    }

    pub async fn initiate_call(
        &self,
        appointment_id: &str,
        call_type: CallType,
        initiator: &AuthUser,
    ) -> AppResult<CallSession> {
        let appointment = self
            .appointments
            .find(appointment_id)
            .await?
            .ok_or_else(|| {
                AppError::new(ErrorCode::AppointmentNotFound, format!("appointment {appointment_id} not found"))
            })?;

        let initiator_role = if appointment.doctor_identity == initiator.identity {
            InitiatorRole::Doctor
        } else if appointment.patient_identity == initiator.identity {
            InitiatorRole::Patient
        } else {
            return Err(AppError::new(
                ErrorCode::Forbidden,
                "only the appointment's doctor or patient can start a call",
            ));
        };

        let guard = self.initiate_lock(appointment_id).lock().await;

        if let Some(live) = self.store.find_live_by_appointment(appointment_id).await? {
            return Err(AppError::with_details(
                ErrorCode::InvalidCallState,
                "a call is already in progress for this appointment",
                serde_json::json!({ "callId": live.id, "status": live.status }),
            ));
        }

        let ice = self.turn.issue_ice_server_list();
        let session = CallSession::new(&appointment, call_type, initiator_role, ice.ice_servers, Utc::now());
        self.store.insert(&session).await?;
        drop(guard);

        counter!("calls_initiated_total", "call_type" => call_type.as_str()).increment(1);
        tracing::info!(
            call_id = %session.id,
            appointment_id = %appointment_id,
            call_type = %call_type,
            initiator_role = %initiator_role,
            "call session created"
        );

        self.events.call_initiated(&session, &initiator.identity).await;
        Ok(session)
    }

    pub async fn get_call_session(&self, call_id: Uuid) -> AppResult<CallSession> {
        self.store
            .find(call_id)
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::CallNotFound, format!("call session {call_id} not found")))
    }

    pub async fn get_call_by_appointment(&self, appointment_id: &str) -> AppResult<CallSession> {
        self.store
            .find_live_by_appointment(appointment_id)
            .await?
            .ok_or_else(|| {
                AppError::new(
                    ErrorCode::NoLiveCall,
                    format!("no live call for appointment {appointment_id}"),
                )
            })
    }

    pub async fn save_offer_sdp(&self, call_id: Uuid, sdp: String) -> AppResult<CallSession> {
        let len = sdp.len();
        let session = self
            .update(call_id, |s| s.set_offer(sdp.clone()).map(|_| true))
            .await?;
        tracing::info!(call_id = %call_id, sdp_len = len, status = %session.status, "offer SDP saved");
        Ok(session)
    }

    pub async fn save_answer_sdp(&self, call_id: Uuid, sdp: String) -> AppResult<CallSession> {
        let len = sdp.len();
        let session = self
            .update(call_id, |s| s.set_answer(sdp.clone()).map(|_| true))
            .await?;
        tracing::info!(call_id = %call_id, sdp_len = len, "answer SDP saved");
        Ok(session)
    }

    /// Explicit activation, sent by a client once its ICE connection is up.
    pub async fn mark_active(&self, call_id: Uuid) -> AppResult<CallSession> {
        let session = self.update(call_id, |s| s.mark_active(Utc::now())).await?;
        tracing::info!(call_id = %call_id, started_at = ?session.started_at, "call active");
        Ok(session)
    }

    pub async fn end_call(&self, call_id: Uuid, reason: EndReason, qos: CallQos) -> AppResult<CallSession> {
        let session = self
            .update(call_id, |s| s.end(reason, qos.clone(), Utc::now()).map(|_| true))
            .await?;

        counter!(
            "calls_ended_total",
            "status" => session.status.as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);
        tracing::info!(
            call_id = %call_id,
            reason = %reason,
            status = %session.status,
            duration_seconds = ?session.duration_seconds,
            "call ended"
        );

        self.events.call_ended(&session).await;
        Ok(session)
    }

    pub async fn get_call_quality(&self, call_id: Uuid) -> AppResult<CallQuality> {
        Ok(self.get_call_session(call_id).await?.quality())
    }

    pub async fn list_call_history(&self, identity: &str, page: &PaginationParams) -> AppResult<Vec<CallSession>> {
        let offset = i64::try_from(page.offset()).unwrap_or(i64::MAX);
        let limit = i64::try_from(page.limit()).unwrap_or(100);
        self.store.list_by_participant(identity, offset, limit).await
    }

    /// Read-modify-write with optimistic concurrency. `apply` returns whether it changed
    /// the session; unchanged sessions are not written back.
    async fn update<F>(&self, call_id: Uuid, mut apply: F) -> AppResult<CallSession>
    where
        F: FnMut(&mut CallSession) -> AppResult<bool> + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut session = self.get_call_session(call_id).await?;
            if !apply(&mut session)? {
                return Ok(session);
            }
            if self.store.update_versioned(&session).await? {
                session.version += 1;
                return Ok(session);
            }
            tracing::debug!(call_id = %call_id, attempt, "concurrent call session update, retrying");
        }

        Err(AppError::new(
            ErrorCode::CallUpdateConflict,
            "call session is being modified concurrently, try again",
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::clients::appointments::StaticAppointmentDirectory;
    use crate::models::{Appointment, CallStatus};
    use crate::store::MemoryCallSessionStore;
    use carelink_shared::types::auth::UserRole;

    #[derive(Default)]
    struct RecordingPublisher {
        events: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl CallEventPublisher for RecordingPublisher {
        async fn call_initiated(&self, session: &CallSession, _initiator_identity: &str) {
            self.events.lock().unwrap().push(format!("initiated:{}", session.id));
        }

        async fn call_ended(&self, session: &CallSession) {
            self.events.lock().unwrap().push(format!("ended:{}", session.status));
        }
    }

    struct Fixture {
        service: CallService,
        store: Arc<MemoryCallSessionStore>,
        events: Arc<RecordingPublisher>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryCallSessionStore::new());
        let events = Arc::new(RecordingPublisher::default());
        let directory = StaticAppointmentDirectory::new([Appointment {
            id: "A1".into(),
            doctor_id: "d-1".into(),
            doctor_identity: "doc@clinic.test".into(),
            patient_id: "p-1".into(),
            patient_identity: "pat@clinic.test".into(),
        }]);
        let service = CallService::new(
            store.clone(),
            Arc::new(directory),
            TurnCredentialIssuer::new("secret", "turn.clinic.test", 3600).unwrap(),
            events.clone(),
        );
        Fixture { service, store, events }
    }

    fn user(identity: &str, role: UserRole) -> AuthUser {
        AuthUser {
            subject: format!("sub-{identity}"),
            identity: identity.into(),
            roles: vec![role],
        }
    }

    fn doctor() -> AuthUser {
        user("doc@clinic.test", UserRole::Doctor)
    }

    fn patient() -> AuthUser {
        user("pat@clinic.test", UserRole::User)
    }

    #[tokio::test]
    async fn appointment_call_walkthrough() {
        let f = fixture();

        let s1 = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        assert_eq!(s1.status, CallStatus::Initiated);
        assert_eq!(s1.initiator_role, InitiatorRole::Doctor);
        assert_eq!(s1.ice_servers.len(), 5);

        let joined = f.service.get_call_by_appointment("A1").await.unwrap();
        assert_eq!(joined.id, s1.id);
        assert_eq!(joined.status, CallStatus::Initiated);

        let ringing = f.service.save_offer_sdp(s1.id, "sdp1".into()).await.unwrap();
        assert_eq!(ringing.status, CallStatus::Ringing);

        let answered = f.service.save_answer_sdp(s1.id, "sdp2".into()).await.unwrap();
        assert_eq!(answered.status, CallStatus::Ringing);
        assert_eq!(answered.answer_sdp.as_deref(), Some("sdp2"));

        f.service.mark_active(s1.id).await.unwrap();
        let ended = f
            .service
            .end_call(s1.id, EndReason::Completed, CallQos::default())
            .await
            .unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.duration_seconds.is_some());

        let events = f.events.events.lock().unwrap().clone();
        assert_eq!(events, vec![format!("initiated:{}", s1.id), "ended:ENDED".to_string()]);
    }

    #[tokio::test]
    async fn patient_initiating_is_recorded_as_patient() {
        let f = fixture();
        let s = f.service.initiate_call("A1", CallType::Audio, &patient()).await.unwrap();
        assert_eq!(s.initiator_role, InitiatorRole::Patient);
        assert_eq!(s.counterpart_identity(), "doc@clinic.test");
    }

    #[tokio::test]
    async fn unknown_appointment_and_outsiders_are_rejected() {
        let f = fixture();
        let err = f.service.initiate_call("nope", CallType::Video, &doctor()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AppointmentNotFound));

        let outsider = user("mallory@clinic.test", UserRole::Doctor);
        let err = f.service.initiate_call("A1", CallType::Video, &outsider).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Forbidden));
    }

    #[tokio::test]
    async fn second_live_session_is_refused_until_first_ends() {
        let f = fixture();
        let first = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        let err = f.service.initiate_call("A1", CallType::Video, &patient()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidCallState));

        f.service
            .end_call(first.id, EndReason::NoAnswer, CallQos::default())
            .await
            .unwrap();
        let err = f.service.get_call_by_appointment("A1").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NoLiveCall));

        let retry = f.service.initiate_call("A1", CallType::Video, &patient()).await.unwrap();
        assert_ne!(retry.id, first.id);
    }

    #[tokio::test]
    async fn concurrent_initiates_create_one_session() {
        let f = Arc::new(fixture());
        let a = {
            let f = f.clone();
            tokio::spawn(async move { f.service.initiate_call("A1", CallType::Video, &doctor()).await })
        };
        let b = {
            let f = f.clone();
            tokio::spawn(async move { f.service.initiate_call("A1", CallType::Video, &patient()).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(f.store.list_by_participant("doc@clinic.test", 0, 10).await.unwrap().len(), 1);
    }

    /// Holds every `call.initiated` publication until the test releases it.
    struct StalledPublisher {
        entered: tokio::sync::Notify,
        release: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl CallEventPublisher for StalledPublisher {
        async fn call_initiated(&self, _session: &CallSession, _initiator_identity: &str) {
            self.entered.notify_one();
            let _ = self.release.acquire().await;
        }

        async fn call_ended(&self, _session: &CallSession) {}
    }

    #[tokio::test]
    async fn slow_broker_does_not_hold_the_initiate_lock() {
        let publisher = Arc::new(StalledPublisher {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Semaphore::new(0),
        });
        let directory = StaticAppointmentDirectory::new([Appointment {
            id: "A1".into(),
            doctor_id: "d-1".into(),
            doctor_identity: "doc@clinic.test".into(),
            patient_id: "p-1".into(),
            patient_identity: "pat@clinic.test".into(),
        }]);
        let service = Arc::new(CallService::new(
            Arc::new(MemoryCallSessionStore::new()),
            Arc::new(directory),
            TurnCredentialIssuer::new("secret", "turn.clinic.test", 3600).unwrap(),
            publisher.clone(),
        ));

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.initiate_call("A1", CallType::Video, &doctor()).await })
        };
        publisher.entered.notified().await;

        // The first call is stored but its event is still in flight.
        let second = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            service.initiate_call("A1", CallType::Video, &patient()),
        )
        .await
        .expect("initiate blocked behind a pending publish");
        assert_eq!(second.unwrap_err().code(), Some(ErrorCode::InvalidCallState));

        publisher.release.add_permits(1);
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn repeated_offer_is_invalid_and_keeps_first() {
        let f = fixture();
        let s = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        f.service.save_offer_sdp(s.id, "first".into()).await.unwrap();

        let err = f.service.save_offer_sdp(s.id, "second".into()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidCallState));
        let stored = f.service.get_call_session(s.id).await.unwrap();
        assert_eq!(stored.offer_sdp.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn racing_offers_have_exactly_one_winner() {
        let f = Arc::new(fixture());
        let call_id = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap().id;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let f = f.clone();
                tokio::spawn(async move { f.service.save_offer_sdp(call_id, format!("sdp-{i}")).await })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(
                    e.code(),
                    Some(ErrorCode::InvalidCallState | ErrorCode::CallUpdateConflict)
                )),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn unknown_call_is_not_found() {
        let f = fixture();
        let id = Uuid::new_v4();
        assert_eq!(
            f.service.save_offer_sdp(id, "x".into()).await.unwrap_err().code(),
            Some(ErrorCode::CallNotFound)
        );
        assert_eq!(
            f.service.end_call(id, EndReason::Completed, CallQos::default()).await.unwrap_err().code(),
            Some(ErrorCode::CallNotFound)
        );
        assert_eq!(
            f.service.get_call_quality(id).await.unwrap_err().code(),
            Some(ErrorCode::CallNotFound)
        );
    }

    #[tokio::test]
    async fn end_without_activation_has_no_duration() {
        let f = fixture();
        let s = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        let ended = f
            .service
            .end_call(s.id, EndReason::Cancelled, CallQos::default())
            .await
            .unwrap();
        assert_eq!(ended.duration_seconds, None);
        assert_eq!(ended.end_reason, Some(EndReason::Cancelled));
    }

    #[tokio::test]
    async fn end_after_activation_measures_duration() {
        let f = fixture();
        let s = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        let mut active = f.service.mark_active(s.id).await.unwrap();

        // Pretend the call went live 30 seconds ago.
        active.started_at = active.started_at.map(|t| t - Duration::seconds(30));
        assert!(f.store.update_versioned(&active).await.unwrap());

        let qos = CallQos {
            network_type: Some("4g".into()),
            device_info: Some("iPhone".into()),
        };
        let ended = f.service.end_call(s.id, EndReason::Completed, qos).await.unwrap();
        let duration = ended.duration_seconds.unwrap();
        assert!((29..=31).contains(&duration), "duration was {duration}");

        let quality = f.service.get_call_quality(s.id).await.unwrap();
        assert_eq!(quality.network_type.as_deref(), Some("4g"));
        assert_eq!(quality.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn mark_active_twice_keeps_start_time() {
        let f = fixture();
        let s = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        let first = f.service.mark_active(s.id).await.unwrap();
        let second = f.service.mark_active(s.id).await.unwrap();
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn failure_reason_ends_in_failed_and_blocks_further_changes() {
        let f = fixture();
        let s = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        let failed = f.service.end_call(s.id, EndReason::Failed, CallQos::default()).await.unwrap();
        assert_eq!(failed.status, CallStatus::Failed);

        let err = f.service.end_call(s.id, EndReason::Completed, CallQos::default()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidCallState));
        let err = f.service.mark_active(s.id).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidCallState));
    }

    #[tokio::test]
    async fn history_lists_own_calls_only() {
        let f = fixture();
        let s = f.service.initiate_call("A1", CallType::Video, &doctor()).await.unwrap();
        f.service.end_call(s.id, EndReason::Completed, CallQos::default()).await.unwrap();
        f.service.initiate_call("A1", CallType::Audio, &patient()).await.unwrap();

        let first_page = PaginationParams { page: 1, per_page: 0 };
        let history = f.service.list_call_history("pat@clinic.test", &first_page).await.unwrap();
        assert_eq!(history.len(), 1, "page size is clamped to at least one");
        assert_eq!(history[0].call_type, CallType::Audio);

        let second_page = PaginationParams { page: 2, per_page: 1 };
        let older = f.service.list_call_history("pat@clinic.test", &second_page).await.unwrap();
        assert_eq!(older[0].call_type, CallType::Video);

        let all = PaginationParams::default();
        assert_eq!(f.service.list_call_history("pat@clinic.test", &all).await.unwrap().len(), 2);
        assert!(f.service.list_call_history("stranger", &all).await.unwrap().is_empty());
    }
}
