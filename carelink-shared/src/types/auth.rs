use serde::{Deserialize, Serialize};

/// Realm roles issued by the identity provider that the call services care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    Doctor,
    User,
    Admin,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Doctor => write!(f, "DOCTOR"),
            UserRole::User => write!(f, "USER"),
            UserRole::Admin => write!(f, "ADMIN"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DOCTOR" => Ok(UserRole::Doctor),
            "USER" | "PATIENT" => Ok(UserRole::User),
            "ADMIN" => Ok(UserRole::Admin),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Access token claims in the identity provider's layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_access: Option<RealmAccess>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

impl Claims {
    /// Login identity: `preferred_username`, then `email`, then the subject.
    pub fn identity(&self) -> &str {
        self.preferred_username
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.sub)
    }

    /// Known realm roles; unrecognised role strings are skipped.
    pub fn roles(&self) -> Vec<UserRole> {
        self.realm_access
            .as_ref()
            .map(|ra| ra.roles.iter().filter_map(|r| r.parse().ok()).collect())
            .unwrap_or_default()
    }
}

/// Verified caller, produced by the token verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub subject: String,
    pub identity: String,
    pub roles: Vec<UserRole>,
}

impl AuthUser {
    pub fn has_role(&self, role: UserRole) -> bool {
        self.roles.contains(&role)
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        let roles = claims.roles();
        let identity = claims.identity().to_string();
        Self {
            subject: claims.sub,
            identity,
            roles,
        }
    }
}
