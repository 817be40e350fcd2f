//! Per-request claims.
//!
//! Authentication stages attach the verified [`Claims`] to the request's
//! extensions; later stages and handlers read them back. Stages that wrap
//! authentication (audit) cannot see the request after it has been handed
//! inward, so they install a [`ClaimsSlot`] first and read it once the inner
//! service returns.

use http::Request;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use crate::authn::types::Claims;

/// Verified claims stored in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedClaims(pub Arc<Claims>);

impl Deref for AuthenticatedClaims {
    type Target = Claims;

    fn deref(&self) -> &Claims {
        &self.0
    }
}

/// Write-once cell shared between an outer stage and the authentication stage.
#[derive(Debug, Clone, Default)]
pub struct ClaimsSlot(Arc<OnceLock<Arc<Claims>>>);

impl ClaimsSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims recorded by the authentication stage, if it ran and succeeded.
    pub fn get(&self) -> Option<Arc<Claims>> {
        self.0.get().cloned()
    }

    fn fill(&self, claims: Arc<Claims>) {
        // The first authenticated identity for a request sticks.
        let _ = self.0.set(claims);
    }
}

/// Attach verified claims to `req`, also filling an installed [`ClaimsSlot`].
pub fn attach_claims<B>(req: &mut Request<B>, claims: Claims) -> Arc<Claims> {
    let claims = Arc::new(claims);
    if let Some(slot) = req.extensions().get::<ClaimsSlot>() {
        slot.fill(claims.clone());
    }
    req.extensions_mut().insert(AuthenticatedClaims(claims.clone()));
    claims
}

/// Claims attached to `req`, if any.
pub fn claims_from_request<B>(req: &Request<B>) -> Option<Arc<Claims>> {
    req.extensions().get::<AuthenticatedClaims>().map(|c| c.0.clone())
}

/// Tenant of the attached claims; empty when no claims are attached or the tenant is unset.
pub fn tenant_from_request<B>(req: &Request<B>) -> String {
    claims_from_request(req)
        .map(|c| c.tenant.clone())
        .unwrap_or_default()
}
