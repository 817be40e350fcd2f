//! Composition of the interceptor stages.

use axum::extract::Request;
use axum::response::Response;
use std::sync::Arc;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use super::audit::AuditLayer;
use super::authn::{BearerAuthLayer, SpiffeAuthLayer};
use super::authz::{AuthzLayer, ProcedureScopes};
use super::options::InterceptorConfig;
use super::tenant::TenantLayer;
use crate::audit::Emitter;
use crate::authn::{SpiffeAuthenticator, TokenValidator};
use crate::authz::RbacEnforcer;

#[derive(Clone)]
enum Authentication {
    Bearer(BearerAuthLayer),
    Spiffe(SpiffeAuthLayer),
}

/// Builder for the full AAA stack around a service.
///
/// Requests pass the configured stages in a fixed order regardless of the
/// order the builder methods are called in:
///
/// ```text
/// audit -> authentication -> authorization -> tenant -> service
/// ```
///
/// Every stage is optional. All stages share the [`InterceptorConfig`] given
/// to [`AaaPipeline::new`].
///
/// ```ignore
/// let app = Router::new()
///     .route("/reports.v1.Reports/Get", post(get_report))
///     .layer(
///         AaaPipeline::new(config)
///             .bearer(relying_party)
///             .authorize(enforcer, procedures)
///             .require_tenant()
///             .audit(emitter),
///     );
/// ```
#[derive(Clone)]
pub struct AaaPipeline {
    config: Arc<InterceptorConfig>,
    authentication: Option<Authentication>,
    authorization: Option<AuthzLayer>,
    tenant: bool,
    audit: Option<AuditLayer>,
}

impl AaaPipeline {
    pub fn new(config: InterceptorConfig) -> Self {
        Self {
            config: Arc::new(config),
            authentication: None,
            authorization: None,
            tenant: false,
            audit: None,
        }
    }

    /// Authenticate with bearer tokens. Replaces any earlier authentication choice.
    pub fn bearer(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.authentication = Some(Authentication::Bearer(BearerAuthLayer::new(
            validator,
            self.config.clone(),
        )));
        self
    }

    /// Authenticate with SPIFFE peer certificates. Replaces any earlier authentication choice.
    pub fn spiffe(mut self, authenticator: Arc<SpiffeAuthenticator>) -> Self {
        self.authentication = Some(Authentication::Spiffe(SpiffeAuthLayer::new(
            authenticator,
            self.config.clone(),
        )));
        self
    }

    pub fn authorize(mut self, enforcer: Arc<RbacEnforcer>, procedures: ProcedureScopes) -> Self {
        self.authorization = Some(AuthzLayer::new(enforcer, Arc::new(procedures), self.config.clone()));
        self
    }

    pub fn require_tenant(mut self) -> Self {
        self.tenant = true;
        self
    }

    pub fn audit(mut self, emitter: Arc<Emitter>) -> Self {
        self.audit = Some(AuditLayer::new(emitter, self.config.clone()));
        self
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    /// Audit events lost to sink failures; zero without an audit stage.
    pub fn dropped_events(&self) -> u64 {
        self.audit.as_ref().map_or(0, AuditLayer::dropped_events)
    }

    /// Wrap `inner` in the configured stages.
    pub fn service<S>(&self, inner: S) -> BoxCloneSyncService<Request, Response, S::Error>
    where
        S: Service<Request, Response = Response> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Send + 'static,
    {
        let mut service = BoxCloneSyncService::new(inner);
        if self.tenant {
            service = BoxCloneSyncService::new(TenantLayer::new(self.config.clone()).layer(service));
        }
        if let Some(authorization) = &self.authorization {
            service = BoxCloneSyncService::new(authorization.layer(service));
        }
        match &self.authentication {
            Some(Authentication::Bearer(layer)) => service = BoxCloneSyncService::new(layer.layer(service)),
            Some(Authentication::Spiffe(layer)) => service = BoxCloneSyncService::new(layer.layer(service)),
            None => {}
        }
        if let Some(audit) = &self.audit {
            service = BoxCloneSyncService::new(audit.layer(service));
        }
        service
    }
}

impl<S> Layer<S> for AaaPipeline
where
    S: Service<Request, Response = Response> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Service = BoxCloneSyncService<Request, Response, S::Error>;

    fn layer(&self, inner: S) -> Self::Service {
        self.service(inner)
    }
}
