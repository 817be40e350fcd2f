//! Authorization: scope-based RBAC and the request-scoped claims carrier

pub mod context;
pub mod rbac;

pub use context::{attach_claims, claims_from_request, tenant_from_request, AuthenticatedClaims, ClaimsSlot};
pub use rbac::{has_all_scopes, has_any_scope, has_scope, validate_scopes, RbacEnforcer, Role};
