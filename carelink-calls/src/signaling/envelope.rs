use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::value::RawValue;

pub const FROM_USER_ID: &str = "fromUserId";

/// Messages the hub itself originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { room_id: String, participant_id: String },
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String, participant_count: usize },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { user_id: String },
    Error { code: &'static str, message: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message is not a JSON object: {0}")]
    NotAnObject(#[source] serde_json::Error),
    #[error("message has no string \"type\" field")]
    MissingType,
}

impl EnvelopeError {
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: "INVALID_ENVELOPE",
            message: self.to_string(),
        }
    }
}

/// A client message ready to forward: same fields, plus `fromUserId` set by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedEnvelope {
    pub kind: String,
    pub text: String,
}

/// Read only the envelope wrapper: every field other than `type` and `fromUserId` is
/// carried through as raw JSON and never decoded.
pub fn stamp(raw: &str, sender_id: &str) -> Result<StampedEnvelope, EnvelopeError> {
    let mut fields: BTreeMap<String, Box<RawValue>> =
        serde_json::from_str(raw).map_err(EnvelopeError::NotAnObject)?;

    let kind = fields
        .get("type")
        .and_then(|t| serde_json::from_str::<String>(t.get()).ok())
        .ok_or(EnvelopeError::MissingType)?;

    let from = serde_json::to_string(sender_id)
        .and_then(RawValue::from_string)
        .map_err(EnvelopeError::NotAnObject)?;
    fields.insert(FROM_USER_ID.to_string(), from);

    let text = serde_json::to_string(&fields).map_err(EnvelopeError::NotAnObject)?;
    Ok(StampedEnvelope { kind, text })
}
