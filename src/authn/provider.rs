//! Token issuance.
//!
//! [`OidcProvider`] signs access, ID and refresh tokens for already
//! authenticated subjects with the current key of a [`KeyStore`], and
//! describes itself through an OIDC discovery document.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{encode, Header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::types::{Claims, OidcProviderConfig, TokenSet, ALLOWED_PROVIDER_ALGORITHMS};
use crate::crypto::{KeyStore, SigningKey};
use crate::error::{AaaError, Result};

/// Claim names the provider sets itself; `ext` entries never override them.
const RESERVED_CLAIMS: &[&str] = &[
    "iss", "sub", "aud", "iat", "exp", "nbf", "jti", "roles", "teams", "scope", "tenant",
];

/// OIDC discovery document.
///
/// Also used by the relying party to read a remote provider's endpoints, so
/// everything except `issuer` and `jwks_uri` may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_types_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_token_signing_alg_values_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_endpoint_auth_methods_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims_supported: Vec<String>,
    /// Number of keys currently published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_count: Option<usize>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Issues signed tokens for authenticated subjects.
pub struct OidcProvider {
    config: OidcProviderConfig,
    keys: Arc<dyn KeyStore>,
}

impl std::fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcProvider")
            .field("issuer", &self.config.issuer)
            .field("algorithm", &self.config.algorithm)
            .finish_non_exhaustive()
    }
}

impl OidcProvider {
    /// Validate `config` and bind it to a key store of the same algorithm.
    pub fn new(mut config: OidcProviderConfig, keys: Arc<dyn KeyStore>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AaaError::Config(format!("oidc_provider: invalid config: {e}")))?;
        if keys.algorithm() != config.algorithm {
            return Err(AaaError::Config(format!(
                "oidc_provider: key store generates {} keys but {} is configured",
                keys.algorithm(),
                config.algorithm
            )));
        }
        Ok(Self { config, keys })
    }

    pub fn config(&self) -> &OidcProviderConfig {
        &self.config
    }

    /// The key store tokens are signed with.
    pub fn key_store(&self) -> Arc<dyn KeyStore> {
        self.keys.clone()
    }

    /// Sign an access token, an ID token and a refresh token for `claims`.
    ///
    /// The signing key is read once, so all three tokens share a `kid` even
    /// if the store rotates concurrently.
    pub fn issue_token_set(&self, claims: &Claims) -> Result<TokenSet> {
        claims.validate()?;

        let key = self
            .keys
            .signing_key()
            .map_err(|e| AaaError::Signing(format!("oidc_provider: failed to get signing key: {e}")))?;

        let now = chrono::Utc::now().timestamp();
        let token_ttl = self.config.token_ttl.as_secs() as i64;
        let refresh_ttl = self.config.refresh_ttl.as_secs() as i64;

        let access_token = self
            .sign(&key, self.full_payload(claims, now, now + token_ttl))
            .map_err(|e| AaaError::Signing(format!("oidc_provider: failed to build access token: {e}")))?;
        let id_token = self
            .sign(&key, self.full_payload(claims, now, now + token_ttl))
            .map_err(|e| AaaError::Signing(format!("oidc_provider: failed to build id token: {e}")))?;
        let refresh_token = self
            .sign(&key, self.base_payload(&claims.sub, now, now + refresh_ttl))
            .map_err(|e| AaaError::Signing(format!("oidc_provider: failed to build refresh token: {e}")))?;

        tracing::debug!(sub = %claims.sub, kid = %key.kid(), "issued token set");

        Ok(TokenSet {
            access_token,
            id_token: Some(id_token),
            refresh_token: Some(refresh_token),
            expires_in: token_ttl,
            token_type: "Bearer".to_string(),
        })
    }

    fn base_payload(&self, sub: &str, iat: i64, exp: i64) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("iss".into(), Value::from(self.config.issuer.clone()));
        payload.insert("sub".into(), Value::from(sub));
        payload.insert("aud".into(), Value::from(self.config.audiences.clone()));
        payload.insert("iat".into(), Value::from(iat));
        payload.insert("exp".into(), Value::from(exp));
        payload
    }

    fn full_payload(&self, claims: &Claims, iat: i64, exp: i64) -> Map<String, Value> {
        let mut payload = self.base_payload(&claims.sub, iat, exp);
        if !claims.roles.is_empty() {
            payload.insert("roles".into(), Value::from(claims.roles.clone()));
        }
        if !claims.teams.is_empty() {
            payload.insert("teams".into(), Value::from(claims.teams.clone()));
        }
        if !claims.scope.is_empty() {
            payload.insert("scope".into(), Value::from(claims.scope.clone()));
        }
        if !claims.tenant.is_empty() {
            payload.insert("tenant".into(), Value::from(claims.tenant.clone()));
        }
        for (name, value) in &claims.ext {
            if RESERVED_CLAIMS.contains(&name.as_str()) {
                tracing::warn!(claim = %name, "ignoring ext entry that shadows a registered claim");
                continue;
            }
            payload.insert(name.clone(), value.clone());
        }
        payload
    }

    fn sign(&self, key: &SigningKey, payload: Map<String, Value>) -> Result<String> {
        let mut header = Header::new(key.algorithm().jwt_algorithm());
        header.kid = Some(key.kid().to_string());
        header.typ = Some("JWT".to_string());
        encode(&header, &payload, key.encoding_key()).map_err(|e| AaaError::Signing(e.to_string()))
    }

    /// Discovery document for `/.well-known/openid-configuration`.
    pub fn discovery_document(&self) -> Result<ProviderMetadata> {
        let key_set = self
            .keys
            .key_set()
            .map_err(|e| AaaError::KeyStore(format!("oidc_provider: failed to get key set: {e}")))?;

        let issuer = self.config.issuer.trim_end_matches('/');
        Ok(ProviderMetadata {
            issuer: self.config.issuer.clone(),
            authorization_endpoint: format!("{issuer}/oauth2/authorize"),
            token_endpoint: format!("{issuer}/oauth2/token"),
            jwks_uri: format!("{issuer}/.well-known/jwks.json"),
            response_types_supported: strings(&["code"]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(ALLOWED_PROVIDER_ALGORITHMS),
            scopes_supported: strings(&["openid", "profile", "email"]),
            token_endpoint_auth_methods_supported: strings(&["client_secret_basic", "client_secret_post"]),
            claims_supported: strings(&["sub", "iss", "aud", "iat", "exp", "roles", "teams", "tenant"]),
            key_count: Some(key_set.keys.len()),
        })
    }
}

/// Axum handler serving the provider's discovery document.
pub async fn discovery_handler(State(provider): State<Arc<OidcProvider>>) -> Response {
    match provider.discovery_document() {
        Ok(doc) => Json(doc).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to build discovery document");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to build discovery document").into_response()
        }
    }
}
