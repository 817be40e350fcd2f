//! Common types for authentication: claims, token sets, and component configs

use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::crypto::SigningAlgorithm;
use crate::error::{AaaError, Result};
use crate::hardening::{validate_algorithm, validate_https_url, validate_spiffe_id};

/// Maximum allowed length for a subject identifier.
pub const MAX_SUBJECT_LENGTH: usize = 256;

/// Maximum size in bytes of a raw token accepted for validation.
pub const MAX_TOKEN_SIZE: usize = 8192;

/// Upper bound for the relying party's clock skew tolerance.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Signing algorithms a relying party may accept.
pub const ALLOWED_RP_ALGORITHMS: &[&str] = &["RS256", "ES256", "PS256"];

/// Signing algorithms the provider can issue tokens with.
pub const ALLOWED_PROVIDER_ALGORITHMS: &[&str] = &["RS256", "ES256"];

/// Which Claims invariant was violated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimsError {
    #[error("sub is required")]
    MissingSubject,
    #[error("sub exceeds maximum length of {MAX_SUBJECT_LENGTH}")]
    SubjectTooLong,
    #[error("iss is required")]
    MissingIssuer,
    #[error("aud must contain at least one audience")]
    MissingAudience,
    #[error("iat is required")]
    MissingIssuedAt,
    #[error("exp is required")]
    MissingExpiry,
    #[error("exp must be after iat")]
    ExpiryNotAfterIssuedAt,
}

/// Identity and authorization payload of a token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier
    pub sub: String,
    /// Issuer
    pub iss: String,
    /// Intended audiences
    pub aud: Vec<String>,
    /// Issued-at instant; `None` means unset
    #[serde(with = "chrono::serde::ts_seconds_option", default)]
    pub iat: Option<DateTime<Utc>>,
    /// Expiry instant; `None` means unset
    #[serde(with = "chrono::serde::ts_seconds_option", default)]
    pub exp: Option<DateTime<Utc>>,
    /// Granted `resource:action` scopes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    /// Role names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Team memberships
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teams: Vec<String>,
    /// Tenant identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    /// Application-specific claims
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ext: HashMap<String, Value>,
}

impl Claims {
    /// Claims for `sub` issued by `iss` to `aud`, valid for `ttl` from now.
    pub fn new(sub: impl Into<String>, iss: impl Into<String>, aud: Vec<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        let exp = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl));
        Self {
            sub: sub.into(),
            iss: iss.into(),
            aud,
            iat: Some(now),
            exp,
            ..Default::default()
        }
    }

    /// Check that all required fields are present and within bounds.
    pub fn validate(&self) -> std::result::Result<(), ClaimsError> {
        if self.sub.is_empty() {
            return Err(ClaimsError::MissingSubject);
        }
        if self.sub.chars().count() > MAX_SUBJECT_LENGTH {
            return Err(ClaimsError::SubjectTooLong);
        }
        if self.iss.is_empty() {
            return Err(ClaimsError::MissingIssuer);
        }
        if self.aud.is_empty() {
            return Err(ClaimsError::MissingAudience);
        }
        let iat = self.iat.ok_or(ClaimsError::MissingIssuedAt)?;
        let exp = self.exp.ok_or(ClaimsError::MissingExpiry)?;
        if exp <= iat {
            return Err(ClaimsError::ExpiryNotAfterIssuedAt);
        }
        Ok(())
    }

    /// Whether `scope` was granted directly on these claims.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.iter().any(|s| s == scope)
    }

    /// Whether the subject holds `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Tokens returned from issuance or a code exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires
    pub expires_in: i64,
    /// Always `"Bearer"` for issued tokens
    pub token_type: String,
}

/// Relying party configuration
#[derive(Debug, Clone, Default)]
pub struct OidcRpConfig {
    /// HTTPS URL of the OIDC provider
    pub issuer_url: String,
    /// OAuth 2.0 client identifier
    pub client_id: String,
    /// Client secret (absent for public clients)
    pub client_secret: Option<String>,
    /// Callback URL registered with the provider
    pub redirect_url: String,
    /// Scopes to request; defaults to `["openid"]`
    pub scopes: Vec<String>,
    /// Accepted signing algorithms; defaults to RS256, ES256, PS256
    pub algorithms: Vec<Algorithm>,
    /// Clock skew tolerance; defaults to 30 seconds, at most 5 minutes
    pub clock_skew: Duration,
}

impl OidcRpConfig {
    /// Validate the configuration and fill in defaults.
    pub fn validate(&mut self) -> Result<()> {
        validate_https_url(&self.issuer_url, "oidc_rp_config: issuer_url")?;
        if self.client_id.is_empty() {
            return Err(AaaError::Config("oidc_rp_config: client_id is required".to_string()));
        }
        if self.scopes.is_empty() {
            self.scopes = vec!["openid".to_string()];
        }
        if self.algorithms.is_empty() {
            self.algorithms = vec![Algorithm::RS256, Algorithm::ES256, Algorithm::PS256];
        }
        for alg in &self.algorithms {
            validate_algorithm(&format!("{alg:?}"), ALLOWED_RP_ALGORITHMS)
                .map_err(|e| AaaError::Config(format!("oidc_rp_config: {e}")))?;
        }
        if self.clock_skew.is_zero() {
            self.clock_skew = Duration::from_secs(30);
        }
        if self.clock_skew > MAX_CLOCK_SKEW {
            return Err(AaaError::Config(format!(
                "oidc_rp_config: clock_skew must not exceed {}s",
                MAX_CLOCK_SKEW.as_secs()
            )));
        }
        Ok(())
    }
}

/// Token issuer configuration
#[derive(Debug, Clone)]
pub struct OidcProviderConfig {
    /// HTTPS URL identifying this provider
    pub issuer: String,
    /// Audiences issued tokens are intended for
    pub audiences: Vec<String>,
    /// Signing algorithm; RS256 unless configured otherwise
    pub algorithm: SigningAlgorithm,
    /// Access and ID token lifetime; defaults to 1 hour
    pub token_ttl: Duration,
    /// Refresh token lifetime; defaults to 24 hours
    pub refresh_ttl: Duration,
}

impl Default for OidcProviderConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audiences: Vec::new(),
            algorithm: SigningAlgorithm::RS256,
            token_ttl: Duration::ZERO,
            refresh_ttl: Duration::ZERO,
        }
    }
}

impl OidcProviderConfig {
    /// Validate the configuration and fill in defaults.
    pub fn validate(&mut self) -> Result<()> {
        validate_https_url(&self.issuer, "oidc_provider_config: issuer")?;
        if self.audiences.is_empty() || self.audiences.iter().any(String::is_empty) {
            return Err(AaaError::Config(
                "oidc_provider_config: audiences must contain at least one non-empty entry".to_string(),
            ));
        }
        validate_algorithm(self.algorithm.as_str(), ALLOWED_PROVIDER_ALGORITHMS)
            .map_err(|e| AaaError::Config(format!("oidc_provider_config: {e}")))?;
        if self.token_ttl.is_zero() {
            self.token_ttl = Duration::from_secs(60 * 60);
        }
        if self.refresh_ttl.is_zero() {
            self.refresh_ttl = Duration::from_secs(24 * 60 * 60);
        }
        Ok(())
    }
}

/// SPIFFE peer-certificate authentication configuration
#[derive(Debug, Clone, Default)]
pub struct SpiffeConfig {
    /// Trust domain, e.g. `example.org`
    pub trust_domain: String,
    /// Path of the workload API socket
    pub workload_socket: String,
    /// SPIFFE IDs permitted to authenticate
    pub allowed_ids: Vec<String>,
}

impl SpiffeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trust_domain.is_empty() {
            return Err(AaaError::Config("spiffe_config: trust_domain is required".to_string()));
        }
        if self.workload_socket.is_empty() {
            return Err(AaaError::Config("spiffe_config: workload_socket is required".to_string()));
        }
        if self.allowed_ids.is_empty() {
            return Err(AaaError::Config(
                "spiffe_config: allowed_ids must contain at least one entry".to_string(),
            ));
        }
        for (i, id) in self.allowed_ids.iter().enumerate() {
            validate_spiffe_id(id).map_err(|e| AaaError::Config(format!("spiffe_config: allowed_ids[{i}]: {e}")))?;
        }
        Ok(())
    }
}
