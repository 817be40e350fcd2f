//! Scope enforcement per procedure.

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::error::RpcError;
use super::options::InterceptorConfig;
use crate::authz::{claims_from_request, has_all_scopes, RbacEnforcer};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Scopes required per procedure path. Procedures without an entry, or
/// with an empty list, are not scope-checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcedureScopes(HashMap<String, Vec<String>>);

impl ProcedureScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every scope in `scopes` for `procedure`.
    pub fn require<I, S>(mut self, procedure: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .insert(procedure.into(), scopes.into_iter().map(Into::into).collect());
        self
    }

    pub fn required(&self, procedure: &str) -> Option<&[String]> {
        self.0.get(procedure).map(Vec::as_slice)
    }
}

impl From<HashMap<String, Vec<String>>> for ProcedureScopes {
    fn from(map: HashMap<String, Vec<String>>) -> Self {
        Self(map)
    }
}

/// Checks that the caller's effective scopes cover the procedure's requirements.
///
/// Must sit inside an authentication stage.
#[derive(Clone)]
pub struct AuthzLayer {
    enforcer: Arc<RbacEnforcer>,
    procedures: Arc<ProcedureScopes>,
    config: Arc<InterceptorConfig>,
}

impl AuthzLayer {
    pub fn new(enforcer: Arc<RbacEnforcer>, procedures: Arc<ProcedureScopes>, config: Arc<InterceptorConfig>) -> Self {
        Self {
            enforcer,
            procedures,
            config,
        }
    }
}

impl<S> Layer<S> for AuthzLayer {
    type Service = AuthzMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthzMiddleware {
            inner,
            enforcer: self.enforcer.clone(),
            procedures: self.procedures.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthzMiddleware<S> {
    inner: S,
    enforcer: Arc<RbacEnforcer>,
    procedures: Arc<ProcedureScopes>,
    config: Arc<InterceptorConfig>,
}

impl<S> Service<Request> for AuthzMiddleware<S>
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
        let enforcer = self.enforcer.clone();
        let procedures = self.procedures.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let procedure = request.uri().path().to_string();
            if config.is_public(&procedure) {
                return inner.call(request).await;
            }

            let required = match procedures.required(&procedure) {
                Some(required) if !required.is_empty() => required,
                _ => return inner.call(request).await,
            };

            let Some(claims) = claims_from_request(&request) else {
                return Ok(RpcError::permission_denied("no claims in context; authentication required").into_response());
            };

            let granted = enforcer.resolve_scopes(&claims.scope, &claims.roles);
            if !has_all_scopes(&granted, required) {
                tracing::warn!(procedure = %procedure, sub = %claims.sub, "insufficient scopes");
                return Ok(RpcError::permission_denied(format!(
                    "insufficient scopes for procedure {procedure:?}"
                ))
                .into_response());
            }

            inner.call(request).await
        })
    }
}
