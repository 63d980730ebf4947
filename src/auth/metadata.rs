//! OAuth 2.0 authorization server metadata (RFC 8414).
//!
//! Served at `/.well-known/oauth-authorization-server` so clients can find the
//! issuer that mints the bearer tokens this server accepts, and used to
//! configure [`JwtVerifier`](super::JwtVerifier).

use serde::{Deserialize, Serialize};

pub const OAUTH_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";

/// Which discovery document an issuer publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthServerType {
    /// OpenID Connect: `/.well-known/openid-configuration`.
    #[default]
    Oidc,
    /// Plain OAuth 2.0: `/.well-known/oauth-authorization-server`.
    OAuth,
}

impl AuthServerType {
    pub fn well_known_path(self) -> &'static str {
        match self {
            AuthServerType::Oidc => "/.well-known/openid-configuration",
            AuthServerType::OAuth => OAUTH_METADATA_PATH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default = "default_response_types")]
    pub response_types_supported: Vec<String>,
    #[serde(default = "default_grant_types")]
    pub grant_types_supported: Vec<String>,
    #[serde(default = "default_token_auth_methods")]
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string()]
}

fn default_token_auth_methods() -> Vec<String> {
    vec!["client_secret_basic".to_string()]
}

impl AuthServerMetadata {
    /// Metadata with only the issuer and the JWKS location known.
    pub fn new(issuer: impl Into<String>, jwks_uri: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            jwks_uri: Some(jwks_uri.into()),
            scopes_supported: None,
            response_types_supported: default_response_types(),
            grant_types_supported: default_grant_types(),
            token_endpoint_auth_methods_supported: default_token_auth_methods(),
        }
    }

    /// Where `issuer` publishes its discovery document.
    pub fn discovery_url(issuer: &str, server_type: AuthServerType) -> String {
        format!("{}{}", issuer.trim_end_matches('/'), server_type.well_known_path())
    }

    /// Fetches the issuer's discovery document.
    #[cfg(feature = "auth-jwt")]
    pub async fn discover(
        client: &reqwest::Client,
        issuer: &str,
        server_type: AuthServerType,
    ) -> Result<Self, reqwest::Error> {
        let url = Self::discovery_url(issuer, server_type);
        tracing::debug!(%url, "fetching authorization server metadata");
        client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Self>()
            .await
    }
}
