//! Error types for AAA operations

use crate::authn::types::ClaimsError;

/// Crate-wide error type
#[derive(Debug, thiserror::Error)]
pub enum AaaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid claims: {0}")]
    InvalidClaims(#[from] ClaimsError),

    #[error("OIDC discovery error: {0}")]
    OidcDiscovery(String),

    #[error("JWKS fetch error: {0}")]
    JwksFetch(String),

    #[error("Token validation error: {0}")]
    TokenValidation(String),

    #[error("Token exchange error: {0}")]
    TokenExchange(String),

    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Token signing error: {0}")]
    Signing(String),

    #[error("Peer certificate error: {0}")]
    PeerCertificate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AaaError>;

impl AaaError {
    /// HTTP status an API boundary should answer with for this error.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            AaaError::InvalidClaims(_) | AaaError::TokenValidation(_) => StatusCode::UNAUTHORIZED,
            AaaError::PeerCertificate(_) => StatusCode::UNAUTHORIZED,
            AaaError::TokenExchange(_) => StatusCode::BAD_REQUEST,
            AaaError::OidcDiscovery(_) | AaaError::JwksFetch(_) | AaaError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
