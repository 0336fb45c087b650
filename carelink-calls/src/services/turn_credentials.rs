//! Time-limited TURN credentials (the "TURN REST API" scheme).
//!
//! `username = "<expires_at>:<random>"` and `password = base64(HMAC-SHA1(secret, username))`.
//! A relay holding the same secret can verify a pair without talking to us.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::models::IceServer;

type HmacSha1 = Hmac<Sha1>;

const RANDOM_SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    /// Unix epoch seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerList {
    pub ice_servers: Vec<IceServer>,
    pub expires_at: i64,
}

/// Stateless issuer: everything derives from the shared secret and the clock.
#[derive(Clone)]
pub struct TurnCredentialIssuer {
    mac: HmacSha1,
    domain: String,
    ttl_secs: i64,
}

impl std::fmt::Debug for TurnCredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentialIssuer")
            .field("domain", &self.domain)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TurnCredentialIssuer {
    pub fn new(
        secret: &str,
        domain: impl Into<String>,
        ttl_secs: u64,
    ) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha1::new_from_slice(secret.as_bytes())?,
            domain: domain.into(),
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        })
    }

    fn sign(&self, username: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(username.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    pub fn issue(&self) -> TurnCredentials {
        self.issue_at(Utc::now().timestamp())
    }

    pub fn issue_at(&self, now: i64) -> TurnCredentials {
        let expires_at = now.saturating_add(self.ttl_secs);
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(char::from)
            .collect();
        let username = format!("{expires_at}:{suffix}");
        let password = self.sign(&username);

        TurnCredentials {
            username,
            password,
            expires_at,
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.verify_at(username, password, Utc::now().timestamp())
    }

    /// Recompute the HMAC and check the expiry encoded in the username prefix.
    pub fn verify_at(&self, username: &str, password: &str, now: i64) -> bool {
        let Some(expires_at) = username
            .split_once(':')
            .and_then(|(prefix, _)| prefix.parse::<i64>().ok())
        else {
            return false;
        };
        if now > expires_at {
            return false;
        }
        self.sign(username).as_bytes().ct_eq(password.as_bytes()).into()
    }

    pub fn issue_ice_server_list(&self) -> IceServerList {
        self.ice_server_list_for(self.issue())
    }

    /// One STUN entry plus TURN over UDP, TCP and TLS, all sharing `credentials`.
    pub fn ice_server_list_for(&self, credentials: TurnCredentials) -> IceServerList {
        let domain = &self.domain;
        let turn_urls = [
            format!("turn:{domain}:80"),
            format!("turn:{domain}:80?transport=tcp"),
            format!("turn:{domain}:443"),
            format!("turns:{domain}:443?transport=tcp"),
        ];

        let mut ice_servers = Vec::with_capacity(turn_urls.len() + 1);
        ice_servers.push(IceServer {
            urls: vec![format!("stun:{domain}:80")],
            username: None,
            credential: None,
        });
        ice_servers.extend(turn_urls.into_iter().map(|url| IceServer {
            urls: vec![url],
            username: Some(credentials.username.clone()),
            credential: Some(credentials.password.clone()),
        }));

        IceServerList {
            ice_servers,
            expires_at: credentials.expires_at,
        }
    }
}
