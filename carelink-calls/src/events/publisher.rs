use async_trait::async_trait;

use carelink_shared::clients::rabbitmq::RabbitMQClient;
use carelink_shared::types::event::{payloads, routing_keys, Event};

use crate::models::CallSession;

const SOURCE: &str = "carelink-calls";

/// Outbound call lifecycle events. Publication never fails the caller.
#[async_trait]
pub trait CallEventPublisher: Send + Sync {
    async fn call_initiated(&self, session: &CallSession, initiator_identity: &str);

    async fn call_ended(&self, session: &CallSession);
}

fn initiated_event(session: &CallSession, initiator_identity: &str) -> Event<payloads::CallInitiated> {
    Event::new(
        SOURCE,
        routing_keys::CALLS_CALL_INITIATED,
        payloads::CallInitiated {
            call_id: session.id,
            appointment_id: session.appointment_id.clone(),
            call_type: session.call_type.to_string(),
            initiator_role: session.initiator_role.to_string(),
            initiator_identity: initiator_identity.to_string(),
            notify_identity: session.counterpart_identity().to_string(),
        },
    )
    .with_user(initiator_identity)
    .with_correlation(session.id)
}

fn ended_event(session: &CallSession) -> Event<payloads::CallEnded> {
    Event::new(
        SOURCE,
        routing_keys::CALLS_CALL_ENDED,
        payloads::CallEnded {
            call_id: session.id,
            appointment_id: session.appointment_id.clone(),
            status: session.status.to_string(),
            end_reason: session
                .end_reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
            duration_seconds: session.duration_seconds,
        },
    )
    .with_correlation(session.id)
}

pub struct RabbitCallEventPublisher {
    rabbitmq: RabbitMQClient,
}

impl RabbitCallEventPublisher {
    pub fn new(rabbitmq: RabbitMQClient) -> Self {
        Self { rabbitmq }
    }
}

#[async_trait]
impl CallEventPublisher for RabbitCallEventPublisher {
    async fn call_initiated(&self, session: &CallSession, initiator_identity: &str) {
        let event = initiated_event(session, initiator_identity);
        if let Err(e) = self
            .rabbitmq
            .publish(routing_keys::CALLS_CALL_INITIATED, &event)
            .await
        {
            tracing::error!(error = %e, call_id = %session.id, "failed to publish call.initiated event");
        }
    }

    async fn call_ended(&self, session: &CallSession) {
        let event = ended_event(session);
        if let Err(e) = self
            .rabbitmq
            .publish(routing_keys::CALLS_CALL_ENDED, &event)
            .await
        {
            tracing::error!(error = %e, call_id = %session.id, "failed to publish call.ended event");
        }
    }
}

/// Used when no broker is configured: events are only logged.
#[derive(Debug, Default)]
pub struct LogCallEventPublisher;

#[async_trait]
impl CallEventPublisher for LogCallEventPublisher {
    async fn call_initiated(&self, session: &CallSession, initiator_identity: &str) {
        let event = initiated_event(session, initiator_identity);
        tracing::info!(
            event_id = %event.id,
            call_id = %session.id,
            notify = %event.data.notify_identity,
            "call.initiated (no broker configured)"
        );
    }

    async fn call_ended(&self, session: &CallSession) {
        let event = ended_event(session);
        tracing::info!(
            event_id = %event.id,
            call_id = %session.id,
            status = %event.data.status,
            duration_seconds = ?event.data.duration_seconds,
            "call.ended (no broker configured)"
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{Appointment, CallQos, CallType, EndReason, InitiatorRole};

    fn session(role: InitiatorRole) -> CallSession {
        let appointment = Appointment {
            id: "A1".into(),
            doctor_id: "d".into(),
            doctor_identity: "doc@clinic.test".into(),
            patient_id: "p".into(),
            patient_identity: "pat@clinic.test".into(),
        };
        CallSession::new(&appointment, CallType::Video, role, vec![], Utc::now())
    }

    #[test]
    fn initiated_event_notifies_the_counterpart() {
        let event = initiated_event(&session(InitiatorRole::Patient), "pat@clinic.test");
        assert_eq!(event.event_type, routing_keys::CALLS_CALL_INITIATED);
        assert_eq!(event.data.notify_identity, "doc@clinic.test");
        assert_eq!(event.data.initiator_role, "PATIENT");
        assert_eq!(event.user_id.as_deref(), Some("pat@clinic.test"));
    }

    #[test]
    fn lifecycle_events_correlate_on_call_id() {
        let mut s = session(InitiatorRole::Doctor);
        let initiated = initiated_event(&s, "doc@clinic.test");
        s.end(EndReason::Completed, CallQos::default(), Utc::now()).unwrap();
        let ended = ended_event(&s);
        assert_eq!(initiated.correlation_id, Some(s.id));
        assert_eq!(ended.correlation_id, Some(s.id));
        assert_ne!(initiated.id, ended.id);
    }

    #[test]
    fn ended_event_carries_outcome() {
        let mut s = session(InitiatorRole::Doctor);
        s.end(EndReason::Cancelled, CallQos::default(), Utc::now()).unwrap();
        let event = ended_event(&s);
        assert_eq!(event.data.status, "ENDED");
        assert_eq!(event.data.end_reason, "CANCELLED");
        assert_eq!(event.data.duration_seconds, None);
    }
}
