//! Authentication stages.
//!
//! Each stage establishes the caller's identity for non-public procedures
//! and attaches the resulting [`Claims`](crate::authn::Claims) to the
//! request, or rejects it as `unauthenticated`.

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::error::RpcError;
use super::options::InterceptorConfig;
use crate::authn::{SpiffeAuthenticator, TokenValidator};
use crate::authz::attach_claims;
use crate::axum_integration::extract_bearer_token;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// DER-encoded peer certificate chain, leaf first.
///
/// Inserted into request extensions by the TLS acceptor for mutual-TLS
/// connections; read by [`SpiffeAuthLayer`].
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(pub Vec<Vec<u8>>);

/// Validates `Authorization: Bearer` tokens.
#[derive(Clone)]
pub struct BearerAuthLayer {
    validator: Arc<dyn TokenValidator>,
    config: Arc<InterceptorConfig>,
}

impl BearerAuthLayer {
    pub fn new(validator: Arc<dyn TokenValidator>, config: Arc<InterceptorConfig>) -> Self {
        Self { validator, config }
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthMiddleware {
            inner,
            validator: self.validator.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BearerAuthMiddleware<S> {
    inner: S,
    validator: Arc<dyn TokenValidator>,
    config: Arc<InterceptorConfig>,
}

impl<S> Service<Request> for BearerAuthMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let validator = self.validator.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let procedure = request.uri().path().to_string();
            if config.is_public(&procedure) {
                return inner.call(request).await;
            }

            let Some(token) = extract_bearer_token(request.headers()) else {
                tracing::warn!(procedure = %procedure, "unauthenticated request: missing or malformed bearer token");
                return Ok(RpcError::unauthenticated("missing bearer token").into_response());
            };

            let claims = match validator.validate_token(&token).await {
                Ok(claims) => claims,
                Err(e) => {
                    tracing::warn!(procedure = %procedure, error = %e, "unauthenticated request: token validation failed");
                    return Ok(RpcError::unauthenticated("invalid token").into_response());
                }
            };

            tracing::debug!(procedure = %procedure, sub = %claims.sub, "authenticated request");
            attach_claims(&mut request, claims);
            inner.call(request).await
        })
    }
}

/// Authenticates workloads by the SPIFFE ID of their peer certificate.
#[derive(Clone)]
pub struct SpiffeAuthLayer {
    authenticator: Arc<SpiffeAuthenticator>,
    config: Arc<InterceptorConfig>,
}

impl SpiffeAuthLayer {
    pub fn new(authenticator: Arc<SpiffeAuthenticator>, config: Arc<InterceptorConfig>) -> Self {
        Self { authenticator, config }
    }
}

impl<S> Layer<S> for SpiffeAuthLayer {
    type Service = SpiffeAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SpiffeAuthMiddleware {
            inner,
            authenticator: self.authenticator.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SpiffeAuthMiddleware<S> {
    inner: S,
    authenticator: Arc<SpiffeAuthenticator>,
    config: Arc<InterceptorConfig>,
}

impl<S> Service<Request> for SpiffeAuthMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let authenticator = self.authenticator.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let procedure = request.uri().path().to_string();
            if config.is_public(&procedure) {
                return inner.call(request).await;
            }

            let Some(PeerCertificates(certs)) = request.extensions().get::<PeerCertificates>() else {
                tracing::warn!(procedure = %procedure, "unauthenticated request: no peer certificates");
                return Ok(RpcError::unauthenticated("spiffe: could not read peer certificates").into_response());
            };

            let spiffe_id = match authenticator.validate_peer_certificate(certs) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(procedure = %procedure, error = %e, "unauthenticated request: peer validation failed");
                    return Ok(RpcError::unauthenticated("spiffe: peer validation failed").into_response());
                }
            };

            tracing::debug!(procedure = %procedure, spiffe_id = %spiffe_id, "authenticated peer");
            attach_claims(&mut request, SpiffeAuthenticator::claims_for(&spiffe_id));
            inner.call(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::spiffe::test_certificate;
    use crate::authn::{Claims, SpiffeConfig};
    use crate::authz::claims_from_request;
    use crate::error::{AaaError, Result};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use tower::util::BoxCloneSyncService;

    /// Accepts exactly one token value.
    struct StaticValidator;

    #[async_trait]
    impl TokenValidator for StaticValidator {
        async fn validate_token(&self, raw_token: &str) -> Result<Claims> {
            if raw_token == "good-token" {
                Ok(Claims {
                    sub: "user-1".to_string(),
                    ..Default::default()
                })
            } else {
                Err(AaaError::TokenValidation("token verification failed".to_string()))
            }
        }
    }

    /// Echoes the authenticated subject, or "none".
    fn echo_subject() -> BoxCloneSyncService<Request, Response, Infallible> {
        BoxCloneSyncService::new(tower::service_fn(|req: Request| async move {
            let sub = claims_from_request(&req).map(|c| c.sub.clone()).unwrap_or_else(|| "none".to_string());
            Ok::<Response, Infallible>(sub.into_response())
        }))
    }

    fn bearer_layer(public: &[&str]) -> BearerAuthLayer {
        let config = InterceptorConfig::builder().public_procedures(public.iter().copied()).build();
        BearerAuthLayer::new(Arc::new(StaticValidator), Arc::new(config))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(path: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(path);
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_bearer_token_attaches_claims() {
        let mut service = tower::ServiceBuilder::new()
            .layer(bearer_layer(&[]))
            .service(echo_subject());

        let response = service.call(request("/svc/Get", Some("Bearer good-token"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "user-1");
    }

    #[tokio::test]
    async fn test_missing_and_malformed_headers_rejected() {
        let mut service = tower::ServiceBuilder::new()
            .layer(bearer_layer(&[]))
            .service(echo_subject());

        for auth in [None, Some("Basic dXNlcjpwYXNz"), Some("Bearer "), Some("Bearertoken")] {
            let response = service.call(request("/svc/Get", auth)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{auth:?}");
        }
    }

    #[tokio::test]
    async fn test_invalid_token_rejected_without_leaking_it() {
        let mut service = tower::ServiceBuilder::new()
            .layer(bearer_layer(&[]))
            .service(echo_subject());

        let response = service.call(request("/svc/Get", Some("Bearer bad-token"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!body_text(response).await.contains("bad-token"));
    }

    #[tokio::test]
    async fn test_public_procedure_bypasses_authentication() {
        let mut service = tower::ServiceBuilder::new()
            .layer(bearer_layer(&["/health/Check"]))
            .service(echo_subject());

        let response = service.call(request("/health/Check", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "none");
    }

    fn spiffe_layer() -> SpiffeAuthLayer {
        let authenticator = SpiffeAuthenticator::new(SpiffeConfig {
            trust_domain: "example.org".to_string(),
            workload_socket: "unix:///run/spire/agent.sock".to_string(),
            allowed_ids: vec!["spiffe://example.org/api".to_string()],
        })
        .unwrap();
        SpiffeAuthLayer::new(Arc::new(authenticator), Arc::new(InterceptorConfig::default()))
    }

    #[tokio::test]
    async fn test_spiffe_peer_accepted() {
        let mut service = tower::ServiceBuilder::new().layer(spiffe_layer()).service(echo_subject());

        let mut req = request("/svc/Get", None);
        req.extensions_mut()
            .insert(PeerCertificates(vec![test_certificate(&["spiffe://example.org/api"])]));

        let response = service.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "spiffe://example.org/api");
    }

    #[tokio::test]
    async fn test_spiffe_rejections() {
        let mut service = tower::ServiceBuilder::new().layer(spiffe_layer()).service(echo_subject());

        let response = service.call(request("/svc/Get", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut req = request("/svc/Get", None);
        req.extensions_mut()
            .insert(PeerCertificates(vec![test_certificate(&["spiffe://example.org/other"])]));
        let response = service.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
