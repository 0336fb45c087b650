use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::auth::TokenVerifier;
use crate::errors::{AppError, ErrorCode};
use crate::types::auth::AuthUser;

/// Application state that can hand out the token verifier.
pub trait HasTokenVerifier {
    fn token_verifier(&self) -> &TokenVerifier;
}

impl<T: HasTokenVerifier> HasTokenVerifier for Arc<T> {
    fn token_verifier(&self) -> &TokenVerifier {
        (**self).token_verifier()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: HasTokenVerifier + Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)?;
        state.token_verifier().verify(token)
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let auth_header = headers
        .get("Authorization")
        .ok_or_else(|| AppError::new(ErrorCode::Unauthorized, "missing authorization header"))?
        .to_str()
        .map_err(|_| AppError::new(ErrorCode::Unauthorized, "invalid authorization header"))?;

    auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::new(ErrorCode::Unauthorized, "authorization header must use Bearer scheme"))
}
