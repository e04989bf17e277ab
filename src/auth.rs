//! Bearer-credential verification for the session handshake.
//!
//! Credentials are HS256 JWTs minted by the external account service
//! and verified here against the shared secret. Verification failure
//! closes the connection before any document-specific work happens;
//! the failure reason is logged, never sent to the peer.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Role carried inside the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Display name, echoed into presence broadcasts.
    pub username: String,
    /// Authorization role; absent means ordinary user.
    #[serde(default)]
    pub role: Role,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
    /// Issued at time (Unix timestamp).
    pub iat: u64,
}

/// Credential verification errors.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No credential was supplied at all.
    MissingCredential,
    /// Signature/expiry/shape check failed.
    InvalidCredential(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingCredential => write!(f, "Missing credential"),
            AuthError::InvalidCredential(e) => write!(f, "Invalid credential: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Mint a token. Used by tests and by deployments that co-host the
/// account service; the engine itself only verifies.
pub fn create_token(
    secret: &str,
    user_id: Uuid,
    username: impl Into<String>,
    role: Role,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let claims = Claims {
        sub: user_id,
        username: username.into(),
        role,
        exp: now + ttl_secs,
        iat: now,
    };

    let key = EncodingKey::from_secret(secret.as_ref());
    encode(&Header::default(), &claims, &key)
}

/// Verify and decode a token against the shared secret.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let key = DecodingKey::from_secret(secret.as_ref());
    let validation = Validation::default();

    let token_data = decode::<Claims>(token, &key, &validation)
        .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;
    Ok(token_data.claims)
}
