use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use carelink_shared::errors::AppResult;
use carelink_shared::types::api::ApiResponse;
use carelink_shared::types::auth::AuthUser;

use crate::services::turn_credentials::IceServerList;
use crate::AppState;

// ---------------------------------------------------------------------------
// GET /api/webrtc/ice-servers
// ---------------------------------------------------------------------------

/// Fresh TURN credentials for a client that needs to (re)gather candidates.
pub async fn get_ice_servers(
    auth_user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<IceServerList>>> {
    let list = state.calls.turn().issue_ice_server_list();
    tracing::debug!(identity = %auth_user.identity, expires_at = list.expires_at, "issued ICE server list");
    Ok(Json(ApiResponse::ok(list)))
}
