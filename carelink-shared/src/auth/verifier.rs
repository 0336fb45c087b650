use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::errors::{AppError, AppResult, ErrorCode};
use crate::types::auth::{AuthUser, Claims};

/// Verifies bearer tokens issued by the external identity provider.
///
/// Stateless: holds only the decoding key and validation rules, so it is
/// cheap to clone into every connection task.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .field("iss", &self.validation.iss)
            .field("aud", &self.validation.aud)
            .finish()
    }
}

impl TokenVerifier {
    /// Shared-secret verification (HS256).
    pub fn hs256(secret: &str) -> Self {
        Self::with_key(DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
    }

    /// Public-key verification (RS256), as used by an OpenID Connect realm.
    pub fn rs256_pem(public_key_pem: &str) -> AppResult<Self> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| AppError::internal(format!("invalid RS256 public key: {e}")))?;
        Ok(Self::with_key(key, Algorithm::RS256))
    }

    fn with_key(key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self { key, validation }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.validate_aud = true;
        self.validation.set_audience(&[audience]);
        self
    }

    /// Validate signature, expiry and (if configured) issuer/audience.
    ///
    /// Never mutates state and never retries; every failure is returned.
    pub fn verify(&self, token: &str) -> AppResult<AuthUser> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::unauthorized("authentication required"));
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AppError::new(ErrorCode::TokenExpired, "token has expired"),
            _ => AppError::new(ErrorCode::TokenInvalid, format!("invalid token: {e}")),
        })?;

        Ok(AuthUser::from(data.claims))
    }
}
