use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use carelink_shared::errors::{AppError, AppResult};

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Active,
    Ended,
    Failed,
}

impl CallStatus {
    pub const LIVE: [CallStatus; 3] = [CallStatus::Initiated, CallStatus::Ringing, CallStatus::Active];

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed)
    }
}

/// Which side of the appointment started the call. Resolved once at initiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InitiatorRole {
    Doctor,
    Patient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    Completed,
    Cancelled,
    NoAnswer,
    Declined,
    Failed,
}

impl EndReason {
    /// Status a session lands in when ended for this reason.
    pub fn terminal_status(self) -> CallStatus {
        match self {
            EndReason::Failed => CallStatus::Failed,
            _ => CallStatus::Ended,
        }
    }
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(format!("unknown {}: {s}", stringify!($ty))),
                }
            }
        }
    };
}

string_enum!(CallType { Audio => "AUDIO", Video => "VIDEO" });
string_enum!(CallStatus {
    Initiated => "INITIATED",
    Ringing => "RINGING",
    Active => "ACTIVE",
    Ended => "ENDED",
    Failed => "FAILED",
});
string_enum!(InitiatorRole { Doctor => "DOCTOR", Patient => "PATIENT" });
string_enum!(EndReason {
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
    NoAnswer => "NO_ANSWER",
    Declined => "DECLINED",
    Failed => "FAILED",
});

// --- ICE servers ---

/// One entry of the ICE server list handed to browsers (`RTCIceServer` shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

// --- Appointment (owned by the appointment service) ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub doctor_id: String,
    pub doctor_identity: String,
    pub patient_id: String,
    pub patient_identity: String,
}

// --- CallSession ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: Uuid,
    pub appointment_id: String,
    pub doctor_id: String,
    pub doctor_identity: String,
    pub patient_id: String,
    pub patient_identity: String,
    pub call_type: CallType,
    pub status: CallStatus,
    pub initiator_role: InitiatorRole,
    pub offer_sdp: Option<String>,
    pub answer_sdp: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub end_reason: Option<EndReason>,
    pub network_type: Option<String>,
    pub device_info: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every update.
    #[serde(skip)]
    pub version: i64,
}

/// Client-reported quality metadata recorded when a call ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallQos {
    pub network_type: Option<String>,
    pub device_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallQuality {
    pub call_id: Uuid,
    pub duration_seconds: Option<i64>,
    pub status: CallStatus,
    pub end_reason: Option<EndReason>,
    pub network_type: Option<String>,
    pub call_type: CallType,
}

impl CallSession {
    pub fn new(
        appointment: &Appointment,
        call_type: CallType,
        initiator_role: InitiatorRole,
        ice_servers: Vec<IceServer>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            appointment_id: appointment.id.clone(),
            doctor_id: appointment.doctor_id.clone(),
            doctor_identity: appointment.doctor_identity.clone(),
            patient_id: appointment.patient_id.clone(),
            patient_identity: appointment.patient_identity.clone(),
            call_type,
            status: CallStatus::Initiated,
            initiator_role,
            offer_sdp: None,
            answer_sdp: None,
            ice_servers,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            end_reason: None,
            network_type: None,
            device_info: None,
            version: 0,
        }
    }

    pub fn is_participant(&self, identity: &str) -> bool {
        self.doctor_identity == identity || self.patient_identity == identity
    }

    /// The party that should be told about an incoming call.
    pub fn counterpart_identity(&self) -> &str {
        match self.initiator_role {
            InitiatorRole::Doctor => &self.patient_identity,
            InitiatorRole::Patient => &self.doctor_identity,
        }
    }

    pub fn quality(&self) -> CallQuality {
        CallQuality {
            call_id: self.id,
            duration_seconds: self.duration_seconds,
            status: self.status,
            end_reason: self.end_reason,
            network_type: self.network_type.clone(),
            call_type: self.call_type,
        }
    }

    fn ensure_live(&self, action: &str) -> AppResult<()> {
        if self.status.is_terminal() {
            return Err(AppError::invalid_state(format!(
                "cannot {action}: call is already {}",
                self.status
            )));
        }
        Ok(())
    }

    /// Store the caller's offer. The offer is set-once.
    pub fn set_offer(&mut self, sdp: String) -> AppResult<()> {
        self.ensure_live("set offer")?;
        if self.offer_sdp.is_some() {
            return Err(AppError::invalid_state("offer SDP already set"));
        }
        self.offer_sdp = Some(sdp);
        if self.status == CallStatus::Initiated {
            self.status = CallStatus::Ringing;
        }
        Ok(())
    }

    /// Store the callee's answer. Requires an offer and is set-once; status is left as is.
    pub fn set_answer(&mut self, sdp: String) -> AppResult<()> {
        self.ensure_live("set answer")?;
        if self.offer_sdp.is_none() {
            return Err(AppError::invalid_state("answer SDP received before offer"));
        }
        if self.answer_sdp.is_some() {
            return Err(AppError::invalid_state("answer SDP already set"));
        }
        self.answer_sdp = Some(sdp);
        Ok(())
    }

    /// Move to ACTIVE. Returns `false` when the call was already active.
    pub fn mark_active(&mut self, now: DateTime<Utc>) -> AppResult<bool> {
        self.ensure_live("activate")?;
        if self.status == CallStatus::Active {
            return Ok(false);
        }
        self.status = CallStatus::Active;
        self.started_at = Some(now);
        Ok(true)
    }

    pub fn end(&mut self, reason: EndReason, qos: CallQos, now: DateTime<Utc>) -> AppResult<()> {
        self.ensure_live("end call")?;
        self.status = reason.terminal_status();
        self.end_reason = Some(reason);
        self.ended_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|started| (now - started).num_seconds().max(0));
        if qos.network_type.is_some() {
            self.network_type = qos.network_type;
        }
        if qos.device_info.is_some() {
            self.device_info = qos.device_info;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_shared::errors::ErrorCode;
    use chrono::Duration;

    fn appointment() -> Appointment {
        Appointment {
            id: "A1".into(),
            doctor_id: "d-1".into(),
            doctor_identity: "dr.house@clinic.test".into(),
            patient_id: "p-1".into(),
            patient_identity: "patient@clinic.test".into(),
        }
    }

    fn session() -> CallSession {
        CallSession::new(&appointment(), CallType::Video, InitiatorRole::Doctor, vec![], Utc::now())
    }

    fn assert_invalid_state(result: AppResult<impl fmt::Debug>) {
        let err = result.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidCallState));
    }

    #[test]
    fn offer_moves_initiated_to_ringing_once() {
        let mut s = session();
        s.set_offer("sdp1".into()).unwrap();
        assert_eq!(s.status, CallStatus::Ringing);

        assert_invalid_state(s.set_offer("sdp2".into()));
        assert_eq!(s.offer_sdp.as_deref(), Some("sdp1"));
    }

    #[test]
    fn answer_requires_offer_and_does_not_activate() {
        let mut s = session();
        assert_invalid_state(s.set_answer("early".into()));

        s.set_offer("offer".into()).unwrap();
        s.set_answer("answer".into()).unwrap();
        assert_eq!(s.status, CallStatus::Ringing);
        assert_invalid_state(s.set_answer("again".into()));
    }

    #[test]
    fn activation_is_idempotent() {
        let mut s = session();
        let t0 = Utc::now();
        assert!(s.mark_active(t0).unwrap());
        assert!(!s.mark_active(t0 + Duration::seconds(5)).unwrap());
        assert_eq!(s.started_at, Some(t0));
    }

    #[test]
    fn ending_never_started_call_has_no_duration() {
        let mut s = session();
        s.end(EndReason::NoAnswer, CallQos::default(), Utc::now()).unwrap();
        assert_eq!(s.status, CallStatus::Ended);
        assert_eq!(s.duration_seconds, None);
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn ending_active_call_computes_duration() {
        let mut s = session();
        let t0 = Utc::now();
        s.mark_active(t0).unwrap();
        let qos = CallQos {
            network_type: Some("wifi".into()),
            device_info: None,
        };
        s.end(EndReason::Completed, qos, t0 + Duration::seconds(95)).unwrap();
        assert_eq!(s.duration_seconds, Some(95));
        assert_eq!(s.end_reason, Some(EndReason::Completed));
        assert_eq!(s.network_type.as_deref(), Some("wifi"));
    }

    #[test]
    fn failure_reason_lands_in_failed_and_is_terminal() {
        let mut s = session();
        s.end(EndReason::Failed, CallQos::default(), Utc::now()).unwrap();
        assert_eq!(s.status, CallStatus::Failed);
        assert_invalid_state(s.end(EndReason::Completed, CallQos::default(), Utc::now()));
        assert_invalid_state(s.mark_active(Utc::now()));
        assert_invalid_state(s.set_offer("late".into()));
    }

    #[test]
    fn enums_round_trip_through_strings() {
        assert_eq!("no_answer".parse::<EndReason>(), Ok(EndReason::NoAnswer));
        assert_eq!(EndReason::NoAnswer.as_str(), "NO_ANSWER");
        assert_eq!(serde_json::to_value(EndReason::NoAnswer).unwrap(), "NO_ANSWER");
        assert!("RINGING".parse::<CallStatus>().unwrap().is_live());
        assert!("SCREEN".parse::<CallType>().is_err());
    }

    #[test]
    fn session_serializes_camel_case_without_version() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["appointmentId"], "A1");
        assert_eq!(json["initiatorRole"], "DOCTOR");
        assert!(json.get("version").is_none());
    }

    #[test]
    fn counterpart_is_the_non_initiating_side() {
        let s = session();
        assert_eq!(s.counterpart_identity(), "patient@clinic.test");
        assert!(s.is_participant("dr.house@clinic.test"));
        assert!(!s.is_participant("intruder@clinic.test"));
    }
}
