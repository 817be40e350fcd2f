//! Options shared by the interceptor stages

use std::collections::HashSet;

use crate::audit::EventType;

/// Immutable per-pipeline options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptorConfig {
    public_procedures: HashSet<String>,
    skip_audit_types: HashSet<EventType>,
}

impl InterceptorConfig {
    pub fn builder() -> InterceptorConfigBuilder {
        InterceptorConfigBuilder::default()
    }

    /// Whether `procedure` bypasses authentication, authorization and tenant checks.
    pub fn is_public(&self, procedure: &str) -> bool {
        self.public_procedures.contains(procedure)
    }

    /// Whether events of `event_type` are suppressed by the audit stage.
    pub fn skips_audit(&self, event_type: EventType) -> bool {
        self.skip_audit_types.contains(&event_type)
    }
}

#[derive(Debug, Default)]
pub struct InterceptorConfigBuilder {
    config: InterceptorConfig,
}

impl InterceptorConfigBuilder {
    /// Exempt these procedure paths from authentication and authorization.
    pub fn public_procedures<I, P>(mut self, procedures: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.config
            .public_procedures
            .extend(procedures.into_iter().map(Into::into));
        self
    }

    /// Suppress audit events of these types.
    pub fn skip_audit_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.config.skip_audit_types.extend(types);
        self
    }

    pub fn build(self) -> InterceptorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates() {
        let cfg = InterceptorConfig::builder()
            .public_procedures(["/health.v1.Health/Check"])
            .public_procedures(vec!["/public/Info".to_string()])
            .skip_audit_types([EventType::AuthzGranted])
            .build();

        assert!(cfg.is_public("/health.v1.Health/Check"));
        assert!(cfg.is_public("/public/Info"));
        assert!(!cfg.is_public("/health.v1.Health/Watch"));
        assert!(cfg.skips_audit(EventType::AuthzGranted));
        assert!(!cfg.skips_audit(EventType::AuthzDenied));
    }

    #[test]
    fn test_default_is_empty() {
        let cfg = InterceptorConfig::default();
        assert!(!cfg.is_public("/"));
        assert!(!cfg.skips_audit(EventType::AuthFailure));
    }
}
