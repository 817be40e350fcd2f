//! # penguin-aaa
//!
//! Authentication, authorization and audit for RPC services.
//!
//! - [`authn`]: token issuance ([`OidcProvider`]), token validation and the
//!   authorization-code flow ([`OidcRelyingParty`]), SPIFFE peer certificates
//! - [`crypto`]: signing key stores and the published key set
//! - [`authz`]: role-to-scope resolution and request-scoped claims
//! - [`audit`]: audit events, the [`Emitter`] and its sinks
//! - [`middleware`]: tower layers composed by [`AaaPipeline`] in the order
//!   audit, authentication, authorization, tenant check
//! - [`config`]: TOML configuration loading

pub mod error;
pub use error::{AaaError, Result};

pub mod audit;
pub mod authn;
pub mod authz;
pub mod axum_integration;
pub mod config;
pub mod crypto;
pub mod hardening;
pub mod middleware;

// Re-export commonly used types at crate root
pub use crate::audit::{AuditEvent, Emitter, EventType, Outcome, Sink};
pub use crate::authn::{
    Claims, OidcProvider, OidcProviderConfig, OidcRelyingParty, OidcRpConfig, SpiffeAuthenticator, SpiffeConfig,
    TokenSet, TokenValidator,
};
pub use crate::authz::{RbacEnforcer, Role};
pub use crate::config::AaaConfig;
pub use crate::crypto::{FileKeyStore, KeyStore, MemoryKeyStore, SigningAlgorithm};
pub use crate::middleware::{AaaPipeline, InterceptorConfig, ProcedureScopes};
