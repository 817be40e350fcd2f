use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::error::RpcError;
use super::options::InterceptorConfig;
use crate::authz::tenant_from_request;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Rejects non-public requests whose claims carry no tenant.
#[derive(Clone)]
pub struct TenantLayer {
    config: Arc<InterceptorConfig>,
}

impl TenantLayer {
    pub fn new(config: Arc<InterceptorConfig>) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for TenantLayer {
    type Service = TenantMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TenantMiddleware {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TenantMiddleware<S> {
    inner: S,
    config: Arc<InterceptorConfig>,
}

impl<S> Service<Request> for TenantMiddleware<S>
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

    fn call(&mut self, request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        Box::pin(async move {
            if !config.is_public(request.uri().path()) && tenant_from_request(&request).is_empty() {
                return Ok(RpcError::permission_denied("missing tenant claim").into_response());
            }
            inner.call(request).await
        })
    }
}
