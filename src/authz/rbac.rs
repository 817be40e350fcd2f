//! Role registry and scope checks.
//!
//! Scopes are `resource:action` strings compared exactly and
//! case-sensitively; roles are named bundles of scopes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{AaaError, Result};

/// A named set of scopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Role {
    pub fn new(name: impl Into<String>, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Thread-safe role registry.
#[derive(Debug, Default)]
pub struct RbacEnforcer {
    roles: RwLock<HashMap<String, Role>>,
}

impl RbacEnforcer {
    /// Registry seeded with `roles`; when a name repeats, the first definition wins.
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        let mut registry = HashMap::new();
        for role in roles {
            registry.entry(role.name.clone()).or_insert(role);
        }
        Self {
            roles: RwLock::new(registry),
        }
    }

    /// Add `role`, replacing any role with the same name.
    pub fn register_role(&self, role: Role) {
        self.roles.write().insert(role.name.clone(), role);
    }

    /// Scopes of the named role as an independent copy, or `None` if unknown.
    pub fn scopes_for_role(&self, name: &str) -> Option<Vec<String>> {
        self.roles.read().get(name).map(|role| role.scopes.clone())
    }

    /// Direct scopes followed by the scopes of every known role, without duplicates.
    ///
    /// Unknown role names contribute nothing.
    pub fn resolve_scopes(&self, direct: &[String], roles: &[String]) -> Vec<String> {
        let registry = self.roles.read();
        let mut seen = HashSet::new();
        let mut effective = Vec::with_capacity(direct.len());

        let role_scopes = roles
            .iter()
            .filter_map(|name| registry.get(name))
            .flat_map(|role| role.scopes.iter());

        for scope in direct.iter().chain(role_scopes) {
            if seen.insert(scope.as_str()) {
                effective.push(scope.clone());
            }
        }
        effective
    }

    pub fn role_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.roles.read().keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn has_scope(scopes: &[String], target: &str) -> bool {
    scopes.iter().any(|s| s == target)
}

/// True when at least one of `required` is present; false for an empty `required`.
pub fn has_any_scope<S: AsRef<str>>(scopes: &[String], required: &[S]) -> bool {
    required.iter().any(|r| has_scope(scopes, r.as_ref()))
}

/// True when every one of `required` is present; true for an empty `required`.
pub fn has_all_scopes<S: AsRef<str>>(scopes: &[String], required: &[S]) -> bool {
    required.iter().all(|r| has_scope(scopes, r.as_ref()))
}

/// Check every scope is `resource:action` with both parts non-empty.
pub fn validate_scopes<S: AsRef<str>>(scopes: &[S]) -> Result<()> {
    for scope in scopes {
        let scope = scope.as_ref();
        match scope.split_once(':') {
            Some((resource, action)) if !resource.is_empty() && !action.is_empty() => {}
            _ => {
                return Err(AaaError::Config(format!(
                    "authz: scope {scope:?} is not in resource:action format"
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_first_registration_wins_at_construction() {
        let rbac = RbacEnforcer::new([
            Role::new("viewer", ["report:read"]),
            Role::new("viewer", ["report:write"]),
        ]);
        assert_eq!(rbac.scopes_for_role("viewer"), Some(s(&["report:read"])));
    }

    #[test]
    fn test_register_role_replaces() {
        let rbac = RbacEnforcer::new([Role::new("viewer", ["report:read"])]);
        rbac.register_role(Role::new("viewer", ["report:list"]));
        assert_eq!(rbac.scopes_for_role("viewer"), Some(s(&["report:list"])));
        assert_eq!(rbac.scopes_for_role("ghost"), None);
    }

    #[test]
    fn test_scopes_for_role_is_a_copy() {
        let rbac = RbacEnforcer::new([Role::new("viewer", ["report:read"])]);
        let mut copy = rbac.scopes_for_role("viewer").unwrap();
        copy.push("report:delete".to_string());
        assert_eq!(rbac.scopes_for_role("viewer"), Some(s(&["report:read"])));
    }

    #[test]
    fn test_resolve_scopes_dedups_in_order() {
        let rbac = RbacEnforcer::new([
            Role::new("viewer", ["report:read"]),
            Role::new("editor", ["report:read", "report:write"]),
        ]);
        let effective = rbac.resolve_scopes(&s(&["user:read", "report:read"]), &s(&["editor", "ghost", "viewer"]));
        assert_eq!(effective, s(&["user:read", "report:read", "report:write"]));
    }

    #[test]
    fn test_role_grants_its_scopes() {
        let rbac = RbacEnforcer::new([
            Role::new("editor", ["doc:write", "doc:read"]),
            Role::new("viewer", ["report:read"]),
        ]);

        let effective = rbac.resolve_scopes(&[], &s(&["editor"]));
        assert!(has_all_scopes(&effective, &["doc:write"]));

        let merged = rbac.resolve_scopes(&s(&["report:read"]), &s(&["viewer"]));
        assert_eq!(merged, s(&["report:read"]));
    }

    #[test]
    fn test_scope_helpers() {
        let scopes = s(&["report:read", "user:write"]);
        assert!(has_scope(&scopes, "report:read"));
        assert!(!has_scope(&scopes, "REPORT:READ"));
        assert!(has_any_scope(&scopes, &["x:y", "user:write"]));
        assert!(!has_any_scope::<&str>(&scopes, &[]));
        assert!(has_all_scopes(&scopes, &["report:read", "user:write"]));
        assert!(!has_all_scopes(&scopes, &["report:read", "user:read"]));
        assert!(has_all_scopes::<&str>(&scopes, &[]));
    }

    #[test]
    fn test_validate_scopes() {
        assert!(validate_scopes(&["report:read", "a:b:c"]).is_ok());
        assert!(validate_scopes::<&str>(&[]).is_ok());
        for bad in ["report", ":read", "report:", ""] {
            let err = validate_scopes(&[bad]).unwrap_err();
            assert!(err.to_string().contains("resource:action"), "{bad}");
        }
    }
}
