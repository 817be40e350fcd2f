//! Token verification against an OIDC provider, plus the authorization code flow.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use super::provider::ProviderMetadata;
use super::types::{Claims, OidcRpConfig, TokenSet, MAX_TOKEN_SIZE};
use crate::error::{AaaError, Result};
use crate::hardening::validate_https_url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum time between key set refetches triggered by an unknown `kid`.
const MIN_JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Registered JWT claims that are never copied into `Claims::ext`.
const REGISTERED_CLAIMS: &[&str] = &["iss", "sub", "aud", "exp", "nbf", "iat", "jti"];

/// Anything that can turn a raw bearer token into validated [`Claims`].
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, raw_token: &str) -> Result<Claims>;
}

#[async_trait]
impl<T: TokenValidator + ?Sized> TokenValidator for Arc<T> {
    async fn validate_token(&self, raw_token: &str) -> Result<Claims> {
        (**self).validate_token(raw_token).await
    }
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Default for Audience {
    fn default() -> Self {
        Audience::Many(Vec::new())
    }
}

impl From<Audience> for Vec<String> {
    fn from(aud: Audience) -> Self {
        match aud {
            Audience::One(a) => vec![a],
            Audience::Many(a) => a,
        }
    }
}

/// `scope` may be a JSON array or an OAuth-style space-delimited string.
fn scope_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scope {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Option::<Scope>::deserialize(deserializer)? {
        Some(Scope::List(list)) => list,
        Some(Scope::Joined(joined)) => joined.split_whitespace().map(str::to_string).collect(),
        None => Vec::new(),
    })
}

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    iss: String,
    #[serde(default)]
    aud: Audience,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default, deserialize_with = "scope_list")]
    scope: Vec<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    teams: Vec<String>,
    #[serde(default)]
    tenant: String,
    #[serde(default)]
    ext: Map<String, Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TokenPayload {
    fn into_claims(self) -> Claims {
        let mut ext: HashMap<String, Value> = self
            .extra
            .into_iter()
            .filter(|(name, _)| !REGISTERED_CLAIMS.contains(&name.as_str()))
            .collect();
        ext.extend(self.ext);

        Claims {
            sub: self.sub,
            iss: self.iss,
            aud: self.aud.into(),
            // A zero `iat` is treated as absent.
            iat: self
                .iat
                .filter(|&t| t != 0)
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
            exp: self.exp.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
            scope: self.scope,
            roles: self.roles,
            teams: self.teams,
            tenant: self.tenant,
            ext,
        }
    }
}

/// Validates tokens from an OIDC provider and drives the authorization code flow.
pub struct OidcRelyingParty {
    config: OidcRpConfig,
    metadata: ProviderMetadata,
    http_client: Client,
    keys: RwLock<Arc<JwkSet>>,
    /// Whether the key set can be refetched from `metadata.jwks_uri`
    remote_keys: bool,
    /// Time of the last unknown-`kid` refetch. Held across the fetch so
    /// concurrent misses wait for one request instead of each sending their own.
    last_refresh: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for OidcRelyingParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcRelyingParty")
            .field("issuer_url", &self.config.issuer_url)
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

impl OidcRelyingParty {
    /// Discover the provider's endpoints and key set from `config.issuer_url`.
    pub async fn discover(mut config: OidcRpConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AaaError::Config(format!("oidc_rp: invalid config: {e}")))?;

        let http_client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let metadata = fetch_metadata(&http_client, &config.issuer_url).await?;
        if metadata.issuer != config.issuer_url {
            return Err(AaaError::OidcDiscovery(format!(
                "issuer mismatch: configured {:?}, provider reported {:?}",
                config.issuer_url, metadata.issuer
            )));
        }
        validate_https_url(&metadata.jwks_uri, "jwks_uri")
            .map_err(|e| AaaError::OidcDiscovery(e.to_string()))?;

        let keys = fetch_jwks(&http_client, &metadata.jwks_uri).await?;
        tracing::debug!(
            issuer = %config.issuer_url,
            keys = keys.keys.len(),
            "discovered OIDC provider"
        );

        Ok(Self {
            config,
            metadata,
            http_client,
            keys: RwLock::new(Arc::new(keys)),
            remote_keys: true,
            last_refresh: Mutex::new(None),
        })
    }

    /// Build a relying party from already-known provider metadata and keys.
    ///
    /// The key set is fixed; an unknown `kid` is rejected without a refetch.
    pub fn from_parts(mut config: OidcRpConfig, metadata: ProviderMetadata, keys: JwkSet) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AaaError::Config(format!("oidc_rp: invalid config: {e}")))?;
        let http_client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            config,
            metadata,
            http_client,
            keys: RwLock::new(Arc::new(keys)),
            remote_keys: false,
            last_refresh: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OidcRpConfig {
        &self.config
    }

    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    /// Verify `raw_token` and extract its claims.
    pub async fn validate_token(&self, raw_token: &str) -> Result<Claims> {
        if raw_token.len() > MAX_TOKEN_SIZE {
            return Err(AaaError::TokenValidation(format!(
                "token size {} exceeds maximum of {MAX_TOKEN_SIZE} bytes",
                raw_token.len()
            )));
        }

        let header = decode_header(raw_token)
            .map_err(|e| AaaError::TokenValidation(format!("invalid token header: {e}")))?;
        if !self.config.algorithms.contains(&header.alg) {
            return Err(AaaError::TokenValidation(format!(
                "signing algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let jwk = self.find_key(header.kid.as_deref()).await?;
        let decoding_key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AaaError::TokenValidation(format!("unusable verification key: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.clock_skew.as_secs();
        validation.set_issuer(&[&self.config.issuer_url]);
        validation.set_audience(&[&self.config.client_id]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub", "aud"]);

        let data = decode::<TokenPayload>(raw_token, &decoding_key, &validation)
            .map_err(|e| AaaError::TokenValidation(format!("token verification failed: {e}")))?;

        let claims = data.claims.into_claims();
        claims
            .validate()
            .map_err(|e| AaaError::TokenValidation(format!("invalid claims: {e}")))?;
        Ok(claims)
    }

    async fn find_key(&self, kid: Option<&str>) -> Result<Jwk> {
        let keys = self.keys.read().clone();
        if let Some(jwk) = select_key(&keys, kid)? {
            return Ok(jwk.clone());
        }
        if !self.remote_keys {
            return Err(unknown_kid());
        }

        let mut last_refresh = self.last_refresh.lock().await;

        // Another caller may have refreshed while this one waited on the lock.
        let keys = self.keys.read().clone();
        if let Some(jwk) = select_key(&keys, kid)? {
            return Ok(jwk.clone());
        }
        if let Some(at) = *last_refresh {
            if at.elapsed() < MIN_JWKS_REFRESH_INTERVAL {
                tracing::debug!(kid = ?kid, "unknown kid, key set refreshed recently; not refetching");
                return Err(unknown_kid());
            }
        }

        // The provider may have rotated since the set was cached. A failed
        // fetch still counts against the interval.
        tracing::debug!(jwks_uri = %self.metadata.jwks_uri, "unknown kid, refreshing key set");
        *last_refresh = Some(Instant::now());
        let refreshed = Arc::new(fetch_jwks(&self.http_client, &self.metadata.jwks_uri).await?);
        *self.keys.write() = refreshed.clone();

        select_key(&refreshed, kid)?.cloned().ok_or_else(unknown_kid)
    }

    /// URL to redirect a user agent to for authorization.
    pub fn auth_code_url(&self, state: &str) -> Result<String> {
        self.build_auth_url(state, None)
    }

    /// Like [`auth_code_url`](Self::auth_code_url) with a PKCE S256 challenge.
    pub fn auth_code_url_with_pkce(&self, state: &str, code_challenge: &str) -> Result<String> {
        self.build_auth_url(state, Some(code_challenge))
    }

    fn build_auth_url(&self, state: &str, code_challenge: Option<&str>) -> Result<String> {
        let endpoint = &self.metadata.authorization_endpoint;
        if endpoint.is_empty() {
            return Err(AaaError::OidcDiscovery(
                "provider does not advertise an authorization endpoint".to_string(),
            ));
        }

        let separator = if endpoint.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            endpoint,
            separator,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_url),
            urlencoding::encode(&self.config.scopes.join(" ")),
            urlencoding::encode(state)
        );

        if let Some(challenge) = code_challenge {
            url.push_str(&format!(
                "&code_challenge={}&code_challenge_method=S256",
                urlencoding::encode(challenge)
            ));
        }

        Ok(url)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange(&self, code: &str) -> Result<TokenSet> {
        self.exchange_code(code, None).await
    }

    /// Exchange an authorization code obtained with a PKCE challenge.
    pub async fn exchange_with_verifier(&self, code: &str, code_verifier: &str) -> Result<TokenSet> {
        self.exchange_code(code, Some(code_verifier)).await
    }

    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> Result<TokenSet> {
        let endpoint = &self.metadata.token_endpoint;
        if endpoint.is_empty() {
            return Err(AaaError::TokenExchange(
                "provider does not advertise a token endpoint".to_string(),
            ));
        }

        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_url.clone()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier.to_string()));
        }

        let mut request = self.http_client.post(endpoint).header("Accept", "application/json");
        match &self.config.client_secret {
            Some(secret) => {
                let credentials = STANDARD.encode(format!(
                    "{}:{}",
                    urlencoding::encode(&self.config.client_id),
                    urlencoding::encode(secret)
                ));
                request = request.header("Authorization", format!("Basic {credentials}"));
            }
            None => params.push(("client_id", self.config.client_id.clone())),
        }

        let response = request
            .form(&params)
            .send()
            .await
            .map_err(|e| AaaError::TokenExchange(format!("code exchange failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AaaError::TokenExchange(format!(
                "code exchange failed with status {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AaaError::TokenExchange(format!("failed to parse token response: {e}")))?;

        Ok(TokenSet {
            access_token: token.access_token,
            id_token: token.id_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in.unwrap_or(0).max(0),
            token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
        })
    }

    /// Compare an OAuth `state` value in constant time.
    ///
    /// Both inputs are hashed first so that neither their lengths nor the
    /// position of the first difference affects timing. Callers must not
    /// accept an empty state they generated themselves.
    pub fn validate_state(received: &str, expected: &str) -> bool {
        let received = Sha256::digest(received.as_bytes());
        let expected = Sha256::digest(expected.as_bytes());
        received[..].ct_eq(&expected[..]).into()
    }
}

#[async_trait]
impl TokenValidator for OidcRelyingParty {
    async fn validate_token(&self, raw_token: &str) -> Result<Claims> {
        OidcRelyingParty::validate_token(self, raw_token).await
    }
}

fn unknown_kid() -> AaaError {
    AaaError::TokenValidation("no verification key matches token kid".to_string())
}

/// Pick the key for `kid`; a set with a single key also matches a token without one.
fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Result<Option<&'a Jwk>> {
    match kid {
        Some(kid) => Ok(keys.find(kid)),
        None if keys.keys.len() == 1 => Ok(keys.keys.first()),
        None => Err(AaaError::TokenValidation(
            "token has no kid and the key set holds more than one key".to_string(),
        )),
    }
}

async fn fetch_metadata(client: &Client, issuer_url: &str) -> Result<ProviderMetadata> {
    let discovery_url = format!("{}/.well-known/openid-configuration", issuer_url.trim_end_matches('/'));
    tracing::debug!(url = %discovery_url, "fetching OIDC discovery document");

    let response = client
        .get(&discovery_url)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| AaaError::OidcDiscovery(format!("failed to fetch discovery document: {e}")))?;

    if !response.status().is_success() {
        return Err(AaaError::OidcDiscovery(format!(
            "discovery document fetch failed with status: {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AaaError::OidcDiscovery(format!("failed to parse discovery document: {e}")))
}

async fn fetch_jwks(client: &Client, jwks_uri: &str) -> Result<JwkSet> {
    tracing::debug!(url = %jwks_uri, "fetching JWKS");

    let response = client
        .get(jwks_uri)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| AaaError::JwksFetch(format!("failed to fetch JWKS: {e}")))?;

    if !response.status().is_success() {
        return Err(AaaError::JwksFetch(format!(
            "JWKS fetch failed with status: {}",
            response.status()
        )));
    }

    let text = response
        .text()
        .await
        .map_err(|e| AaaError::JwksFetch(format!("failed to read JWKS response: {e}")))?;
    let set: JwkSet = serde_json::from_str(&text)
        .map_err(|e| AaaError::JwksFetch(format!("failed to parse JWKS: {e}")))?;

    let usable: Vec<Jwk> = set
        .keys
        .into_iter()
        .filter(|jwk| match DecodingKey::from_jwk(jwk) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(kid = ?jwk.common.key_id, error = %e, "skipping unusable JWK");
                false
            }
        })
        .collect();

    Ok(JwkSet { keys: usable })
}

/// Random 64-character PKCE code verifier.
pub fn generate_code_verifier() -> String {
    use rand::{distributions::Alphanumeric, Rng};
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// S256 code challenge for `verifier`.
pub fn generate_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random `state` parameter.
pub fn generate_state() -> String {
    uuid::Uuid::new_v4().to_string()
}
