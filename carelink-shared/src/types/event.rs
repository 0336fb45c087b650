use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RabbitMQ event envelope wrapping all domain events.
///
/// Routing key format: `carelink.{domain}.{entity}.{action}`
/// Example: `carelink.calls.call.initiated`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T: Serialize> {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
            data,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// RabbitMQ routing keys
pub mod routing_keys {
    pub const CALLS_CALL_INITIATED: &str = "carelink.calls.call.initiated";
    pub const CALLS_CALL_ENDED: &str = "carelink.calls.call.ended";
}

pub mod payloads {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Lets the notification service push an incoming-call alert to `notify_identity`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CallInitiated {
        pub call_id: Uuid,
        pub appointment_id: String,
        pub call_type: String,
        pub initiator_role: String,
        pub initiator_identity: String,
        pub notify_identity: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CallEnded {
        pub call_id: Uuid,
        pub appointment_id: String,
        pub status: String,
        pub end_reason: String,
        pub duration_seconds: Option<i64>,
    }
}
