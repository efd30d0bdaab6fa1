//! Principal resolution.
//!
//! The access-control core never reads ambient state directly: it asks a
//! [`PrincipalResolver`] once per operation. Resolvers are stateless per call or
//! backed by request-scoped context, never by shared mutable state.

use std::future::Future;

use crate::{Principal, ROLE_ADMIN};

tokio::task_local! {
    static CURRENT_PRINCIPAL: Option<Principal>;
}

/// Run `fut` with `principal` as the request-scoped principal.
///
/// [`TaskLocalPrincipalResolver`] reads it back from inside `fut`.
pub async fn with_principal<F>(principal: Option<Principal>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_PRINCIPAL.scope(principal, fut).await
}

pub trait PrincipalResolver: Send + Sync {
    /// The authenticated principal of the current operation, if any.
    fn current_principal(&self) -> Option<Principal>;

    /// Whether `principal` holds administrative privilege.
    fn is_unrestricted(&self, principal: &Principal) -> bool {
        principal.is_unrestricted()
    }

    /// Resolve the principal with the unrestricted verdict applied.
    fn resolve(&self) -> Option<Principal> {
        self.current_principal().map(|p| {
            let unrestricted = self.is_unrestricted(&p);
            p.with_unrestricted(unrestricted)
        })
    }
}

fn default_admin_roles() -> Vec<String> {
    vec![ROLE_ADMIN.to_owned()]
}

fn holds_admin_role(principal: &Principal, admin_roles: &[String]) -> bool {
    admin_roles.iter().any(|r| principal.has_role(r))
}

/// Resolver returning a fixed principal. Intended for batch jobs and tests.
#[derive(Debug, Clone)]
pub struct StaticPrincipalResolver {
    principal: Option<Principal>,
    admin_roles: Vec<String>,
}

impl StaticPrincipalResolver {
    #[must_use]
    pub fn new(principal: Option<Principal>) -> Self {
        Self {
            principal,
            admin_roles: default_admin_roles(),
        }
    }

    #[must_use]
    pub fn for_principal(principal: Principal) -> Self {
        Self::new(Some(principal))
    }

    /// Resolver for an unauthenticated caller.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    #[must_use]
    pub fn with_admin_roles(mut self, roles: Vec<String>) -> Self {
        self.admin_roles = roles;
        self
    }
}

impl PrincipalResolver for StaticPrincipalResolver {
    fn current_principal(&self) -> Option<Principal> {
        self.principal.clone()
    }

    fn is_unrestricted(&self, principal: &Principal) -> bool {
        principal.is_unrestricted() || holds_admin_role(principal, &self.admin_roles)
    }
}

/// Resolver reading the principal installed by [`with_principal`].
///
/// Outside of a `with_principal` scope there is no principal (deny-all).
#[derive(Debug, Clone)]
pub struct TaskLocalPrincipalResolver {
    admin_roles: Vec<String>,
}

impl Default for TaskLocalPrincipalResolver {
    fn default() -> Self {
        Self {
            admin_roles: default_admin_roles(),
        }
    }
}

impl TaskLocalPrincipalResolver {
    #[must_use]
    pub fn with_admin_roles(admin_roles: Vec<String>) -> Self {
        Self { admin_roles }
    }
}

impl PrincipalResolver for TaskLocalPrincipalResolver {
    fn current_principal(&self) -> Option<Principal> {
        CURRENT_PRINCIPAL.try_with(Clone::clone).ok().flatten()
    }

    fn is_unrestricted(&self, principal: &Principal) -> bool {
        principal.is_unrestricted() || holds_admin_role(principal, &self.admin_roles)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::AclValue;

    #[test]
    fn static_resolver_applies_admin_role() {
        let admin = Principal::builder(1_i64).role(ROLE_ADMIN).build();
        let resolved = StaticPrincipalResolver::for_principal(admin).resolve().unwrap();
        assert!(resolved.is_unrestricted());
    }

    #[test]
    fn static_resolver_custom_admin_roles() {
        let p = Principal::builder(1_i64).role("ROLE_ROOT").build();
        let resolver = StaticPrincipalResolver::for_principal(p.clone());
        assert!(!resolver.resolve().unwrap().is_unrestricted());

        let resolver = resolver.with_admin_roles(vec!["ROLE_ROOT".to_owned()]);
        assert!(resolver.resolve().unwrap().is_unrestricted());
    }

    #[test]
    fn anonymous_resolves_to_none() {
        assert!(StaticPrincipalResolver::anonymous().resolve().is_none());
    }

    #[test]
    fn task_local_resolver_outside_scope_is_none() {
        assert!(TaskLocalPrincipalResolver::default().resolve().is_none());
    }

    #[tokio::test]
    async fn task_local_resolver_reads_scoped_principal() {
        let resolver = TaskLocalPrincipalResolver::default();
        let seen = with_principal(Some(Principal::new(42_i64)), async {
            resolver.resolve().map(|p| p.subject_id().clone())
        })
        .await;
        assert_eq!(seen, Some(AclValue::Int(42)));
        assert!(resolver.resolve().is_none());
    }

    #[tokio::test]
    async fn task_local_scopes_are_isolated_per_task() {
        let resolver = TaskLocalPrincipalResolver::default();
        let a = tokio::spawn({
            let resolver = resolver.clone();
            with_principal(Some(Principal::new(1_i64)), async move {
                tokio::task::yield_now().await;
                resolver.resolve().map(|p| p.subject_id().clone())
            })
        });
        let b = tokio::spawn({
            let resolver = resolver.clone();
            with_principal(Some(Principal::new(2_i64)), async move {
                tokio::task::yield_now().await;
                resolver.resolve().map(|p| p.subject_id().clone())
            })
        });
        assert_eq!(a.await.unwrap(), Some(AclValue::Int(1)));
        assert_eq!(b.await.unwrap(), Some(AclValue::Int(2)));
    }
}
