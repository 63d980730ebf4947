//! JWT bearer tokens checked against the issuer's published JWKS.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    jwk::{Jwk, JwkSet},
};
use serde::Deserialize;
use serde_json::Value;
use tokio::{sync::Mutex, time::Instant};

use super::{AuthError, AuthInfo, TokenVerifier, metadata::AuthServerMetadata};

/// Minimum time between two JWKS fetches triggered by unknown key ids.
const JWKS_REFRESH_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JWKS URI not available for JWT verification")]
    MissingJwksUri,
    #[error("failed to fetch JWKS: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("no signing key matches kid {0:?}")]
    UnknownKey(Option<String>),
    #[error("algorithm {0:?} is not accepted for JWKS-verified tokens")]
    Algorithm(Algorithm),
    #[error(transparent)]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Default)]
struct JwksCache {
    keys: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

/// Verifies signed JWTs issued by one authorization server.
///
/// The signature is checked with the key named by the token's `kid` in the
/// issuer's JWKS, fetched lazily and refreshed when an unknown `kid` shows
/// up. Scopes come from the space-separated `scope` claim or, failing that,
/// a `scopes` array.
#[derive(Debug)]
pub struct JwtVerifier {
    issuer: String,
    jwks_uri: String,
    audience: Option<Vec<String>>,
    http: reqwest::Client,
    cache: Mutex<JwksCache>,
}

impl JwtVerifier {
    pub fn new(issuer: impl Into<String>, jwks_uri: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            jwks_uri: jwks_uri.into(),
            audience: None,
            http: reqwest::Client::new(),
            cache: Mutex::new(JwksCache::default()),
        }
    }

    pub fn from_metadata(metadata: &AuthServerMetadata) -> Result<Self, JwtError> {
        let jwks_uri = metadata.jwks_uri.as_ref().ok_or(JwtError::MissingJwksUri)?;
        Ok(Self::new(metadata.issuer.clone(), jwks_uri.clone()))
    }

    /// Only accept tokens whose `aud` names one of `audience`.
    pub fn with_audience(mut self, audience: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.audience = Some(audience.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Seeds the key cache so no fetch happens until an unknown `kid` arrives.
    pub fn with_keys(self, keys: JwkSet) -> Self {
        let cache = JwksCache {
            keys: Some(keys),
            fetched_at: Some(Instant::now()),
        };
        Self {
            cache: Mutex::new(cache),
            ..self
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Full check of one token: header, key, signature, standard claims.
    pub async fn decode(&self, token: &str) -> Result<AuthInfo, JwtError> {
        let header = decode_header(token)?;
        if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(JwtError::Algorithm(header.alg));
        }
        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.required_spec_claims = HashSet::from(["iss".to_string()]);
        match &self.audience {
            Some(audience) => validation.set_audience(audience),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, &key, &validation)?;
        Ok(data.claims.into_auth_info())
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, JwtError> {
        let mut cache = self.cache.lock().await;
        if let Some(jwk) = cache.keys.as_ref().and_then(|keys| find_key(keys, kid)) {
            return Ok(DecodingKey::from_jwk(jwk)?);
        }

        let may_refresh = cache
            .fetched_at
            .is_none_or(|at| at.elapsed() >= JWKS_REFRESH_COOLDOWN);
        if !may_refresh {
            return Err(JwtError::UnknownKey(kid.map(str::to_owned)));
        }

        tracing::debug!(jwks_uri = %self.jwks_uri, ?kid, "fetching JWKS");
        let keys = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        cache.fetched_at = Some(Instant::now());
        let key = find_key(&keys, kid).map(DecodingKey::from_jwk).transpose()?;
        cache.keys = Some(keys);
        key.ok_or_else(|| JwtError::UnknownKey(kid.map(str::to_owned)))
    }
}

/// Picks the key named by `kid`. Tokens without a `kid` are only accepted
/// when the set holds exactly one key.
fn find_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.find(kid),
        None if keys.keys.len() == 1 => keys.keys.first(),
        None => None,
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<AuthInfo, AuthError> {
        self.decode(token).await.map_err(|error| {
            tracing::warn!(%error, issuer = %self.issuer, "token verification failed");
            AuthError::InvalidToken
        })
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    client_id: Option<String>,
    azp: Option<String>,
    aud: Option<Value>,
    scope: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    exp: Option<i64>,
}

impl Claims {
    fn into_auth_info(self) -> AuthInfo {
        let scopes = match self.scope {
            Some(scope) => scope.split_whitespace().map(str::to_owned).collect(),
            None => self.scopes,
        };
        let audience = match self.aud {
            Some(Value::String(aud)) => Some(aud),
            Some(Value::Array(auds)) => auds.into_iter().find_map(|aud| match aud {
                Value::String(aud) => Some(aud),
                _ => None,
            }),
            _ => None,
        };
        AuthInfo {
            subject: self.sub.unwrap_or_default(),
            client_id: self.client_id.or(self.azp).or(audience),
            scopes,
            expires_at: self.exp.and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0)),
        }
    }
}
