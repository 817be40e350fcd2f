//! Axum integration
//!
//! - Bearer token extraction from request headers
//! - `FromRequestParts` extractor for the authenticated [`Claims`]
//! - Router serving the provider's well-known documents
//!
//! # Example
//!
//! ```rust,ignore
//! use axum::{routing::post, Router};
//! use penguin_aaa::axum_integration::{well_known_router, ClaimsExtractor};
//! use penguin_aaa::middleware::RpcError;
//!
//! async fn get_report(claims: ClaimsExtractor) -> Result<String, RpcError> {
//!     claims.require_scope("report:read")?;
//!     Ok(format!("report for {}", claims.tenant))
//! }
//!
//! let app = Router::new()
//!     .route("/reports.v1.Reports/Get", post(get_report))
//!     .layer(pipeline)
//!     .merge(well_known_router(provider));
//! ```

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use std::ops::Deref;
use std::sync::Arc;

use crate::authn::{discovery_handler, Claims, OidcProvider};
use crate::authz::AuthenticatedClaims;
use crate::crypto::jwks_response;
use crate::middleware::RpcError;

pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Extract a non-empty Bearer token from the Authorization header
///
/// # Example
///
/// ```rust,ignore
/// use axum::http::HeaderMap;
/// use penguin_aaa::axum_integration::extract_bearer_token;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("Authorization", "Bearer my-token".parse().unwrap());
///
/// let token = extract_bearer_token(&headers);
/// assert_eq!(token, Some("my-token".to_string()));
/// ```
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}

/// Axum extractor for the claims attached by an authentication stage.
///
/// Handlers behind a public procedure have no claims; extraction then fails
/// with an `unauthenticated` error.
#[derive(Debug, Clone)]
pub struct ClaimsExtractor(pub Arc<Claims>);

impl Deref for ClaimsExtractor {
    type Target = Claims;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ClaimsExtractor {
    pub fn into_inner(self) -> Arc<Claims> {
        self.0
    }

    /// Reject with `permission_denied` unless `scope` was granted directly.
    ///
    /// Role-derived scopes are not resolved here; use the authorization
    /// layer for that.
    pub fn require_scope(&self, scope: &str) -> Result<(), RpcError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            tracing::warn!(sub = %self.sub, scope = %scope, "permission denied: missing scope");
            Err(RpcError::permission_denied(format!("missing required scope {scope:?}")))
        }
    }

    /// Reject with `permission_denied` unless the subject holds `role`.
    pub fn require_role(&self, role: &str) -> Result<(), RpcError> {
        if self.has_role(role) {
            Ok(())
        } else {
            tracing::warn!(sub = %self.sub, role = %role, "permission denied: missing role");
            Err(RpcError::permission_denied(format!("missing required role {role:?}")))
        }
    }
}

impl<S> FromRequestParts<S> for ClaimsExtractor
where
    S: Send + Sync,
{
    type Rejection = RpcError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedClaims>()
            .map(|claims| ClaimsExtractor(claims.0.clone()))
            .ok_or_else(|| RpcError::unauthenticated("no authenticated claims"))
    }
}

async fn provider_jwks(State(provider): State<Arc<OidcProvider>>) -> Response {
    jwks_response(provider.key_store().as_ref())
}

/// Router serving the discovery document and key set of `provider`.
pub fn well_known_router<S>(provider: Arc<OidcProvider>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(DISCOVERY_PATH, get(discovery_handler))
        .route(JWKS_PATH, get(provider_jwks))
        .with_state(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::attach_claims;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;

    #[test]
    fn test_extract_bearer_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer my-secret-token".parse().unwrap());

        let token = extract_bearer_token(&headers);
        assert_eq!(token, Some("my-secret-token".to_string()));
    }

    #[test]
    fn test_extract_bearer_token_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Basic dXNlcjpwYXNz".parse().unwrap());

        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_bearer_token_no_space_or_empty() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearertoken".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert("Authorization", "Bearer ".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_claims_extractor() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        attach_claims(
            &mut req,
            Claims {
                sub: "user-1".to_string(),
                ..Default::default()
            },
        );
        let (mut parts, _) = req.into_parts();
        let claims = ClaimsExtractor::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[tokio::test]
    async fn test_claims_extractor_rejects_anonymous() {
        let (mut parts, _) = Request::builder().body(Body::empty()).unwrap().into_parts();
        let rejection = ClaimsExtractor::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(rejection.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_require_scope_and_role() {
        let claims = ClaimsExtractor(Arc::new(Claims {
            sub: "user-1".to_string(),
            scope: vec!["report:read".to_string()],
            roles: vec!["viewer".to_string()],
            ..Default::default()
        }));

        assert!(claims.require_scope("report:read").is_ok());
        assert!(claims.require_role("viewer").is_ok());

        let denied = claims.require_scope("report:write").unwrap_err();
        assert_eq!(denied.into_response().status(), StatusCode::FORBIDDEN);
        let denied = claims.require_role("admin").unwrap_err();
        assert_eq!(denied.into_response().status(), StatusCode::FORBIDDEN);
    }
}
