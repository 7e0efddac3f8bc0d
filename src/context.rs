//! Per-request security context and tenant scoping
//!
//! Every core operation takes an explicit immutable `SecurityContext`;
//! nothing reads tenancy from ambient state. Storage and vector
//! operations filter by the context's effective tenant.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{MnemaError, Result};
use crate::types::TenantId;

/// Effective tenant a request operates on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantScope {
    /// A specific tenant bucket
    Id(String),
    /// The system/global bucket (stored as NULL tenant)
    System,
    /// Any tenant; only valid for admins
    Any,
}

impl TenantScope {
    /// The stored tenant id this scope filters to. `None` for `Any`
    /// means no filter at all.
    pub fn stored(&self) -> Option<TenantId> {
        match self {
            TenantScope::Id(id) => Some(Some(id.clone())),
            TenantScope::System => Some(None),
            TenantScope::Any => None,
        }
    }
}

/// Immutable per-request identity threaded through every core call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityContext {
    pub tenant: TenantScope,
    #[serde(default)]
    pub scopes: HashSet<String>,
    #[serde(default)]
    pub is_admin: bool,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl SecurityContext {
    /// Context for a specific tenant
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant: TenantScope::Id(tenant_id.into()),
            scopes: HashSet::new(),
            is_admin: false,
            request_id: uuid::Uuid::new_v4().to_string(),
            ip: None,
            user_agent: None,
        }
    }

    /// System-bucket context
    pub fn system() -> Self {
        Self {
            tenant: TenantScope::System,
            scopes: HashSet::new(),
            is_admin: false,
            request_id: uuid::Uuid::new_v4().to_string(),
            ip: None,
            user_agent: None,
        }
    }

    /// Admin context spanning every tenant
    pub fn admin() -> Self {
        Self {
            tenant: TenantScope::Any,
            scopes: HashSet::new(),
            is_admin: true,
            request_id: uuid::Uuid::new_v4().to_string(),
            ip: None,
            user_agent: None,
        }
    }

    /// Resolve the tenant this request may act on, refusing scope
    /// escalation for non-admins.
    ///
    /// `explicit` is a tenant id supplied in the request payload; when
    /// present it must match the caller's own tenant unless the caller
    /// is an admin.
    pub fn effective_tenant(&self, explicit: Option<&TenantScope>) -> Result<TenantScope> {
        match explicit {
            None => {
                if self.tenant == TenantScope::Any && !self.is_admin {
                    return Err(MnemaError::Forbidden(
                        "cross-tenant scope requires admin".to_string(),
                    ));
                }
                Ok(self.tenant.clone())
            }
            Some(requested) => {
                if self.is_admin || *requested == self.tenant {
                    Ok(requested.clone())
                } else {
                    Err(MnemaError::Forbidden(format!(
                        "tenant mismatch for request {}",
                        self.request_id
                    )))
                }
            }
        }
    }

    /// Check an operation scope (e.g. "memories:write")
    pub fn require_scope(&self, scope: &str) -> Result<()> {
        if self.is_admin || self.scopes.is_empty() || self.scopes.contains(scope) {
            Ok(())
        } else {
            Err(MnemaError::Forbidden(format!("missing scope {}", scope)))
        }
    }
}

/// Normalize a raw tenant string from an external surface.
///
/// Empty-ish aliases collapse to the system bucket; the literal
/// "system" means any-tenant (admin surfaces only); everything else is
/// trimmed and kept.
pub fn normalize_tenant_id(raw: &str) -> TenantScope {
    let trimmed = raw.trim();
    match trimmed.to_lowercase().as_str() {
        "" | "anonymous" | "public" | "null" => TenantScope::System,
        "system" => TenantScope::Any,
        _ => TenantScope::Id(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_tenant_id(""), TenantScope::System);
        assert_eq!(normalize_tenant_id("  "), TenantScope::System);
        assert_eq!(normalize_tenant_id("anonymous"), TenantScope::System);
        assert_eq!(normalize_tenant_id("PUBLIC"), TenantScope::System);
        assert_eq!(normalize_tenant_id("NULL"), TenantScope::System);
        assert_eq!(normalize_tenant_id("system"), TenantScope::Any);
        assert_eq!(
            normalize_tenant_id("  u1  "),
            TenantScope::Id("u1".to_string())
        );
    }

    #[test]
    fn test_non_admin_cannot_cross_tenants() {
        let ctx = SecurityContext::for_tenant("a");
        let other = TenantScope::Id("b".to_string());
        assert!(matches!(
            ctx.effective_tenant(Some(&other)),
            Err(MnemaError::Forbidden(_))
        ));
        // Matching explicit tenant is fine
        let same = TenantScope::Id("a".to_string());
        assert_eq!(ctx.effective_tenant(Some(&same)).unwrap(), same);
    }

    #[test]
    fn test_admin_spans_tenants() {
        let ctx = SecurityContext::admin();
        let other = TenantScope::Id("b".to_string());
        assert_eq!(ctx.effective_tenant(Some(&other)).unwrap(), other);
        assert_eq!(ctx.effective_tenant(None).unwrap(), TenantScope::Any);
    }

    #[test]
    fn test_scope_check() {
        let mut ctx = SecurityContext::for_tenant("a");
        ctx.scopes.insert("memories:read".to_string());
        assert!(ctx.require_scope("memories:read").is_ok());
        assert!(ctx.require_scope("memories:write").is_err());
    }
}
