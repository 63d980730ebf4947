//! Bearer-token authentication at the HTTP boundary.
//!
//! Token verification is pluggable through [`TokenVerifier`]: an in-memory
//! [`StaticTokenVerifier`], or a JWKS-backed `JwtVerifier` with the
//! `auth-jwt` feature. The transport
//! only extracts the bearer token, asks the verifier, and enforces required
//! scopes. It runs before the dispatcher, so a rejected call never touches the
//! session registry.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

#[cfg(feature = "auth-jwt")]
mod jwt;
pub mod metadata;

#[cfg(feature = "auth-jwt")]
pub use jwt::{JwtError, JwtVerifier};
pub use metadata::{AuthServerMetadata, AuthServerType, OAUTH_METADATA_PATH};

/// Identity attached to an authenticated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub subject: String,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthInfo {
    pub fn new(subject: impl Into<String>, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            subject: subject.into(),
            client_id: None,
            scopes: scopes.into_iter().map(Into::into).collect(),
            expires_at: None,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Bearer token required")]
    MissingToken,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient scope")]
    InsufficientScope {
        required: Vec<String>,
        granted: Vec<String>,
    },
}

impl AuthError {
    /// JSON body written with the 401/403 response.
    pub fn to_body(&self) -> Value {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => json!({
                "error": "Unauthorized",
                "message": self.to_string(),
            }),
            AuthError::InsufficientScope { required, granted } => json!({
                "error": "Forbidden",
                "message": self.to_string(),
                "required_scopes": required,
                "token_scopes": granted,
            }),
        }
    }
}

/// Verifies a bearer token and returns the identity it stands for.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthInfo, AuthError>;
}

/// Extracts the token from an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let Some(value) = header else {
        return Err(AuthError::MissingToken);
    };
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        Some(_) => {
            tracing::debug!("malformed bearer token: missing token value");
            Err(AuthError::MissingToken)
        }
        None => {
            let scheme = value.split_whitespace().next().unwrap_or("unknown");
            tracing::warn!(scheme, "non-bearer authorization header rejected");
            Err(AuthError::MissingToken)
        }
    }
}

/// Checks that every required scope was granted.
pub fn check_scopes(info: &AuthInfo, required: &[String]) -> Result<(), AuthError> {
    if required.iter().all(|scope| info.has_scope(scope)) {
        Ok(())
    } else {
        Err(AuthError::InsufficientScope {
            required: required.to_vec(),
            granted: info.scopes.clone(),
        })
    }
}

/// Runs the full check for one call: extract, verify, then enforce scopes.
pub async fn authenticate(
    verifier: &dyn TokenVerifier,
    header: Option<&str>,
    required_scopes: &[String],
) -> Result<AuthInfo, AuthError> {
    let token = bearer_token(header)?;
    let info = verifier.verify(token).await?;
    check_scopes(&info, required_scopes)?;
    Ok(info)
}

/// In-memory token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, AuthInfo>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, info: AuthInfo) -> Self {
        self.tokens.insert(token.into(), info);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthInfo, AuthError> {
        match self.tokens.get(token) {
            Some(info) if !info.is_expired() => Ok(info.clone()),
            _ => Err(AuthError::InvalidToken),
        }
    }
}
