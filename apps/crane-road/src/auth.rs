use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity an operator connection carries for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub phone_number: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,
    #[error("credential verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("credential issued to {claimed}, connection asked for {requested}")]
    UserMismatch { claimed: String, requested: String },
    #[error("no credential secret configured")]
    NotConfigured,
}

pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<VerifiedIdentity, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorClaims {
    pub user_id: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
}

/// HS256 bearer tokens signed with a shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<VerifiedIdentity, AuthError> {
        let token = credential.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<OperatorClaims>(token, &self.key, &validation)?;
        let claims = data.claims;
        Ok(VerifiedIdentity {
            user_id: claims.user_id,
            phone_number: claims.phone_number,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}

/// Used when no secret is configured: every operator handshake is refused.
pub struct DenyAll;

impl CredentialVerifier for DenyAll {
    fn verify(&self, _credential: &str) -> Result<VerifiedIdentity, AuthError> {
        Err(AuthError::NotConfigured)
    }
}

/// Verify `credential` and check it was issued to `requested_user`.
pub fn authenticate(
    verifier: &dyn CredentialVerifier,
    credential: Option<&str>,
    requested_user: &str,
) -> Result<VerifiedIdentity, AuthError> {
    let credential = credential.ok_or(AuthError::Missing)?;
    let identity = verifier.verify(credential)?;
    if identity.user_id != requested_user {
        return Err(AuthError::UserMismatch {
            claimed: identity.user_id,
            requested: requested_user.to_string(),
        });
    }
    Ok(identity)
}
