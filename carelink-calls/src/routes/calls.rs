use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use carelink_shared::errors::{AppError, AppResult, ErrorCode};
use carelink_shared::types::api::ApiResponse;
use carelink_shared::types::auth::{AuthUser, UserRole};
use carelink_shared::types::pagination::PaginationParams;

use crate::models::{CallQos, CallQuality, CallSession, CallType, EndReason};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallPayload {
    #[validate(length(min = 1, max = 100, message = "appointmentId must be 1-100 characters"))]
    pub appointment_id: String,
    pub call_type: CallType,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SdpPayload {
    #[validate(length(min = 1, max = 65536, message = "sdp must be 1-65536 characters"))]
    pub sdp: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EndCallPayload {
    pub reason: EndReason,
    #[validate(length(max = 50))]
    pub network_type: Option<String>,
    #[validate(length(max = 255))]
    pub device_info: Option<String>,
}

fn validate(payload: &impl Validate) -> AppResult<()> {
    payload
        .validate()
        .map_err(|e| AppError::new(ErrorCode::ValidationError, e.to_string()))
}

/// Only the two parties of a call (or an admin) may see or drive it.
async fn participant_session(state: &AppState, call_id: Uuid, user: &AuthUser) -> AppResult<CallSession> {
    let session = state.calls.get_call_session(call_id).await?;
    if session.is_participant(&user.identity) || user.has_role(UserRole::Admin) {
        Ok(session)
    } else {
        Err(AppError::new(ErrorCode::Forbidden, "not a participant of this call"))
    }
}

// ---------------------------------------------------------------------------
// POST /api/webrtc/initiate
// ---------------------------------------------------------------------------

pub async fn initiate_call(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InitiateCallPayload>,
) -> AppResult<Json<ApiResponse<CallSession>>> {
    validate(&payload)?;
    let session = state
        .calls
        .initiate_call(&payload.appointment_id, payload.call_type, &auth_user)
        .await?;
    Ok(Json(ApiResponse::ok(session)))
}

// ---------------------------------------------------------------------------
// GET /api/webrtc/calls/appointment/:appointment_id
// ---------------------------------------------------------------------------

pub async fn get_call_by_appointment(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(appointment_id): Path<String>,
) -> AppResult<Json<ApiResponse<CallSession>>> {
    let session = state.calls.get_call_by_appointment(&appointment_id).await?;
    if !session.is_participant(&auth_user.identity) && !auth_user.has_role(UserRole::Admin) {
        return Err(AppError::new(ErrorCode::Forbidden, "not a participant of this call"));
    }
    Ok(Json(ApiResponse::ok(session)))
}

// ---------------------------------------------------------------------------
// GET /api/webrtc/calls/:call_id
// ---------------------------------------------------------------------------

pub async fn get_call(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<CallSession>>> {
    let session = participant_session(&state, call_id, &auth_user).await?;
    Ok(Json(ApiResponse::ok(session)))
}

// ---------------------------------------------------------------------------
// POST /api/webrtc/calls/:call_id/offer and /answer
// ---------------------------------------------------------------------------

pub async fn save_offer(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
    Json(payload): Json<SdpPayload>,
) -> AppResult<Json<ApiResponse<CallSession>>> {
    validate(&payload)?;
    participant_session(&state, call_id, &auth_user).await?;
    let session = state.calls.save_offer_sdp(call_id, payload.sdp).await?;
    Ok(Json(ApiResponse::ok_with_message(session, "offer saved")))
}

pub async fn save_answer(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
    Json(payload): Json<SdpPayload>,
) -> AppResult<Json<ApiResponse<CallSession>>> {
    validate(&payload)?;
    participant_session(&state, call_id, &auth_user).await?;
    let session = state.calls.save_answer_sdp(call_id, payload.sdp).await?;
    Ok(Json(ApiResponse::ok_with_message(session, "answer saved")))
}

// ---------------------------------------------------------------------------
// POST /api/webrtc/calls/:call_id/active
// ---------------------------------------------------------------------------

pub async fn mark_active(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<CallSession>>> {
    participant_session(&state, call_id, &auth_user).await?;
    let session = state.calls.mark_active(call_id).await?;
    Ok(Json(ApiResponse::ok(session)))
}

// ---------------------------------------------------------------------------
// POST /api/webrtc/calls/:call_id/end
// ---------------------------------------------------------------------------

pub async fn end_call(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
    Json(payload): Json<EndCallPayload>,
) -> AppResult<Json<ApiResponse<CallSession>>> {
    validate(&payload)?;
    participant_session(&state, call_id, &auth_user).await?;
    let qos = CallQos {
        network_type: payload.network_type,
        device_info: payload.device_info,
    };
    let session = state.calls.end_call(call_id, payload.reason, qos).await?;
    Ok(Json(ApiResponse::ok_with_message(session, "call ended")))
}

// ---------------------------------------------------------------------------
// GET /api/webrtc/calls/:call_id/quality
// ---------------------------------------------------------------------------

pub async fn get_call_quality(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<CallQuality>>> {
    let session = participant_session(&state, call_id, &auth_user).await?;
    Ok(Json(ApiResponse::ok(session.quality())))
}

// ---------------------------------------------------------------------------
// GET /api/webrtc/calls/history
// ---------------------------------------------------------------------------

pub async fn call_history(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(page): Query<PaginationParams>,
) -> AppResult<Json<ApiResponse<Vec<CallSession>>>> {
    let sessions = state.calls.list_call_history(&auth_user.identity, &page).await?;
    Ok(Json(ApiResponse::ok(sessions)))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::test_support::{bearer, test_router};

    async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn api_requires_bearer_token() {
        let app = test_router();
        let (status, body) = send(&app, Method::GET, "/api/webrtc/calls/history", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "E0004");
    }

    #[tokio::test]
    async fn full_call_flow_over_http() {
        let app = test_router();
        let doctor = bearer("doc@clinic.test", &["DOCTOR"]);
        let patient = bearer("pat@clinic.test", &["USER"]);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/webrtc/initiate",
            Some(&doctor),
            Some(json!({"appointmentId": "A1", "callType": "VIDEO"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "INITIATED");
        assert_eq!(body["data"]["initiatorRole"], "DOCTOR");
        assert!(body["data"]["iceServers"].as_array().unwrap().len() >= 2);
        let call_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, Method::GET, "/api/webrtc/calls/appointment/A1", Some(&patient), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], call_id.as_str());

        let offer_uri = format!("/api/webrtc/calls/{call_id}/offer");
        let (status, body) = send(&app, Method::POST, &offer_uri, Some(&doctor), Some(json!({"sdp": "v=0 offer"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "RINGING");

        let (status, body) = send(&app, Method::POST, &offer_uri, Some(&doctor), Some(json!({"sdp": "again"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "E3004");

        let answer_uri = format!("/api/webrtc/calls/{call_id}/answer");
        let (status, _) = send(&app, Method::POST, &answer_uri, Some(&patient), Some(json!({"sdp": "v=0 answer"}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::POST, &format!("/api/webrtc/calls/{call_id}/active"), Some(&patient), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ACTIVE");

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/api/webrtc/calls/{call_id}/end"),
            Some(&doctor),
            Some(json!({"reason": "COMPLETED", "networkType": "wifi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ENDED");
        assert!(body["data"]["durationSeconds"].is_i64());

        let (status, body) = send(&app, Method::GET, &format!("/api/webrtc/calls/{call_id}/quality"), Some(&patient), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["networkType"], "wifi");
        assert_eq!(body["data"]["endReason"], "COMPLETED");

        let (status, body) = send(&app, Method::GET, "/api/webrtc/calls/history?page=1&per_page=10", Some(&patient), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, Method::GET, "/api/webrtc/calls/appointment/A1", Some(&patient), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "E3003");
    }

    #[tokio::test]
    async fn history_with_huge_page_is_empty() {
        let app = test_router();
        let patient = bearer("pat@clinic.test", &["PATIENT"]);
        let uri = format!("/api/webrtc/calls/history?page={}&per_page=100", u64::MAX);
        let (status, body) = send(&app, Method::GET, &uri, Some(&patient), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_appointment_and_call_are_not_found() {
        let app = test_router();
        let doctor = bearer("doc@clinic.test", &["DOCTOR"]);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/webrtc/initiate",
            Some(&doctor),
            Some(json!({"appointmentId": "missing", "callType": "AUDIO"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "E3002");

        let uri = format!("/api/webrtc/calls/{}", uuid::Uuid::new_v4());
        let (status, body) = send(&app, Method::GET, &uri, Some(&doctor), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "E3001");
    }

    #[tokio::test]
    async fn outsiders_cannot_drive_a_call() {
        let app = test_router();
        let doctor = bearer("doc@clinic.test", &["DOCTOR"]);
        let outsider = bearer("mallory@clinic.test", &["USER"]);

        let (_, body) = send(
            &app,
            Method::POST,
            "/api/webrtc/initiate",
            Some(&doctor),
            Some(json!({"appointmentId": "A1", "callType": "VIDEO"})),
        )
        .await;
        let call_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/api/webrtc/calls/{call_id}/end"),
            Some(&outsider),
            Some(json!({"reason": "CANCELLED"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn invalid_payloads_are_rejected() {
        let app = test_router();
        let doctor = bearer("doc@clinic.test", &["DOCTOR"]);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/webrtc/initiate",
            Some(&doctor),
            Some(json!({"appointmentId": "", "callType": "VIDEO"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "E0002");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/webrtc/initiate",
            Some(&doctor),
            Some(json!({"appointmentId": "A1", "callType": "HOLOGRAM"})),
        )
        .await;
        assert!(status.is_client_error());
    }
}
