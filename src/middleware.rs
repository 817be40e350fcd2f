//! Request interceptors.
//!
//! Each stage is a tower [`Layer`](tower::Layer) over axum requests; the
//! procedure identifier is the request path. [`AaaPipeline`] composes them
//! in the required order.

pub mod audit;
pub mod authn;
pub mod authz;
pub mod error;
pub mod options;
pub mod pipeline;
pub mod tenant;

pub use audit::{AuditLayer, AuditMiddleware};
pub use authn::{BearerAuthLayer, BearerAuthMiddleware, PeerCertificates, SpiffeAuthLayer, SpiffeAuthMiddleware};
pub use authz::{AuthzLayer, AuthzMiddleware, ProcedureScopes};
pub use error::{Code, RpcError};
pub use options::{InterceptorConfig, InterceptorConfigBuilder};
pub use pipeline::AaaPipeline;
pub use tenant::{TenantLayer, TenantMiddleware};
