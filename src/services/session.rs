//! Signed admin session tokens.
//!
//! A token is `<hex(claims json)>.<hex(hmac-sha256)>`. The claims travel with
//! each request in the `Authorization` header and are checked statelessly, so
//! any server instance holding the same secret can verify them.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by an admin session token.
///
/// Inserted into request extensions by the admin auth middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminClaims {
    /// Who the session belongs to
    pub sub: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expires at (Unix seconds)
    pub exp: i64,
    /// Token id, for audit logs
    pub jti: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Malformed session token")]
    Malformed,

    #[error("Invalid session signature")]
    BadSignature,

    #[error("Session expired")]
    Expired,

    #[error("Failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A freshly issued token and its claims.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub claims: AdminClaims,
}

impl IssuedSession {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.claims.exp, 0)
    }
}

/// Issues and verifies admin session tokens.
#[derive(Clone)]
pub struct SessionSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl SessionSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            ttl,
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC key length is valid")
    }

    pub fn issue(&self, subject: &str) -> Result<IssuedSession, SessionError> {
        self.issue_at(subject, Utc::now())
    }

    pub fn issue_at(&self, subject: &str, now: DateTime<Utc>) -> Result<IssuedSession, SessionError> {
        let claims = AdminClaims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: Uuid::new_v4(),
        };

        let payload = serde_json::to_vec(&claims)?;
        let mut mac = self.mac();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        Ok(IssuedSession {
            token: format!("{}.{}", hex::encode(payload), hex::encode(signature)),
            claims,
        })
    }

    pub fn verify(&self, token: &str) -> Result<AdminClaims, SessionError> {
        self.verify_at(token, Utc::now())
    }

    /// Check signature first, then expiry.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<AdminClaims, SessionError> {
        let (payload_hex, signature_hex) = token.split_once('.').ok_or(SessionError::Malformed)?;
        let payload = hex::decode(payload_hex).map_err(|_| SessionError::Malformed)?;
        let signature = hex::decode(signature_hex).map_err(|_| SessionError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        // Constant-time comparison
        mac.verify_slice(&signature)
            .map_err(|_| SessionError::BadSignature)?;

        let claims: AdminClaims =
            serde_json::from_slice(&payload).map_err(|_| SessionError::Malformed)?;
        if claims.exp <= now.timestamp() {
            return Err(SessionError::Expired);
        }

        Ok(claims)
    }
}

/// Verify a submitted password against the configured PHC-format argon2 hash.
///
/// The hash carries its own salt and cost parameters. An unparsable hash
/// never matches.
pub fn verify_password(password_hash: &str, candidate: &str) -> bool {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let Ok(parsed_hash) = PasswordHash::new(password_hash) else {
        tracing::error!("Configured admin password hash is not a valid PHC string");
        return false;
    };

    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed_hash)
        .is_ok()
}
