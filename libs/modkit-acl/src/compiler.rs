//! Predicate compiler: turns entity metadata into an [`AccessExpr`] for a
//! principal, an entity type and a permission kind.
//!
//! Rules are combined with OR: a row is accessible if it is the principal
//! itself, is owned by the principal, carries a grant naming the principal,
//! or has a parent the principal can access under the same kind. Parent
//! recursion tracks the types on the current path and never re-enters one.

use std::sync::Arc;

use modkit_security::{AclValue, PermissionKind, Principal};
use tracing::{debug, trace, warn};

use crate::expr::{AccessExpr, PermissionMatch};
use crate::metadata::{EntityMeta, Link, MetadataRegistry};

#[derive(Debug, Clone)]
pub struct PredicateCompiler {
    registry: Arc<MetadataRegistry>,
}

impl PredicateCompiler {
    #[must_use]
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// Compile the access predicate for `entity_type` under `kind`.
    ///
    /// Never fails: an absent principal is denied, an unrestricted one is
    /// allowed, and unknown or ungoverned types are allowed.
    #[must_use]
    pub fn compile(
        &self,
        principal: Option<&Principal>,
        entity_type: &str,
        kind: PermissionKind,
    ) -> AccessExpr {
        let Some(principal) = principal else {
            debug!(entity = entity_type, %kind, "no principal, access denied");
            return AccessExpr::deny_all();
        };
        if principal.is_unrestricted() {
            trace!(entity = entity_type, %kind, "unrestricted principal, access granted");
            return AccessExpr::allow_all();
        }

        let mut visited = Vec::new();
        let expr = self.compile_type(principal.subject_id(), entity_type, kind, &mut visited);
        if expr.is_deny_all() {
            debug!(
                entity = entity_type,
                %kind,
                "no access rule applies, only unrestricted principals have access"
            );
        }
        expr
    }

    fn compile_type(
        &self,
        subject: &AclValue,
        entity_type: &str,
        kind: PermissionKind,
        visited: &mut Vec<String>,
    ) -> AccessExpr {
        let Some(meta) = self.registry.get(entity_type) else {
            trace!(entity = entity_type, "unknown entity type, treated as ungoverned");
            return AccessExpr::allow_all();
        };
        let Some(rules) = &meta.rules else {
            trace!(entity = entity_type, "ungoverned entity type");
            return AccessExpr::allow_all();
        };

        let mut branches = Vec::new();

        if self.registry.principal_type() == Some(entity_type) {
            trace!(entity = entity_type, column = %meta.id_column, "self rule");
            branches.push(AccessExpr::Identity {
                column: meta.id_column.clone(),
                value: subject.clone(),
            });
        }

        for rule in rules.owners.iter().filter(|r| r.applies_to(kind)) {
            let Some(link) = self.link(meta, &rule.attribute) else {
                continue;
            };
            trace!(entity = entity_type, attribute = %rule.attribute, "owner rule");
            branches.push(AccessExpr::OwnerEq {
                link,
                value: subject.clone(),
            });
        }

        for rule in rules.grant_links.iter().filter(|r| r.applies_to(kind)) {
            let Some(link) = self.link(meta, &rule.attribute) else {
                continue;
            };
            let Some(grant) = self.registry.get(&link.target).and_then(|t| t.grant.as_ref()) else {
                warn!(entity = entity_type, attribute = %rule.attribute, "grant link target has no grant schema");
                continue;
            };
            trace!(entity = entity_type, attribute = %rule.attribute, target = %link.target, "grant link rule");
            branches.push(AccessExpr::GrantLinkEq {
                owner_column: grant.owner_column.clone(),
                value: subject.clone(),
                permission: grant.permission_column.as_ref().map(|column| PermissionMatch {
                    column: column.clone(),
                    accepted: kind.satisfying_names().into_iter().map(str::to_owned).collect(),
                }),
                link,
            });
        }

        for rule in rules.parents.iter().filter(|r| r.applies_to(kind)) {
            let Some(link) = self.link(meta, &rule.attribute) else {
                continue;
            };
            if visited.iter().any(|t| *t == link.target) {
                trace!(
                    entity = entity_type,
                    attribute = %rule.attribute,
                    target = %link.target,
                    "parent already on recursion path, skipped"
                );
                continue;
            }
            trace!(entity = entity_type, attribute = %rule.attribute, target = %link.target, "parent rule");
            visited.push(entity_type.to_owned());
            let inner = self.compile_type(subject, &link.target, kind, visited);
            visited.pop();
            branches.push(AccessExpr::delegate(link, inner));
        }

        AccessExpr::or(branches)
    }

    fn link(&self, meta: &EntityMeta, attribute: &str) -> Option<Link> {
        let link = self.registry.link(meta, attribute);
        if link.is_none() {
            warn!(entity = %meta.name, attribute, "rule references an unresolvable relation");
        }
        link
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::metadata::JoinSpec;
    use tracing_test::traced_test;

    const CONFIG: &str = r"
principal_type: user
entities:
  user: { table: users, columns: [id, name], acl: {} }
  project:
    table: projects
    columns: [id, owner_id]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
    acl: { owners: [owner] }
  order:
    table: orders
    columns: [id, owner_id, project_id]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
      - { attribute: project, target: project, join: { local: project_id } }
      - { attribute: grants, target: order_grant, join: { remote: order_id } }
    acl:
      owners: [owner]
      parents: [{ attribute: project, permissions: [read] }]
      grant_links: [grants]
  order_grant:
    table: order_grants
    columns: [id, order_id, owner_id, permission]
    grant: { owner_column: owner_id, permission_column: permission }
  sealed: { table: sealed, columns: [id], acl: {} }
  country: { table: countries, columns: [id] }
  a:
    table: a
    columns: [id, b_id, owner_id]
    relations:
      - { attribute: b, target: b, join: { local: b_id } }
      - { attribute: owner, target: user, join: { local: owner_id } }
    acl: { owners: [owner], parents: [b] }
  b:
    table: b
    columns: [id, a_id, owner_id]
    relations:
      - { attribute: a, target: a, join: { local: a_id } }
      - { attribute: owner, target: user, join: { local: owner_id } }
    acl: { owners: [owner], parents: [a] }
";

    fn compiler() -> PredicateCompiler {
        PredicateCompiler::new(Arc::new(MetadataRegistry::from_yaml_str(CONFIG).unwrap()))
    }

    fn user(id: i64) -> Principal {
        Principal::new(id)
    }

    #[test]
    fn unrestricted_principal_is_always_allowed() {
        let c = compiler();
        let admin = user(1).with_unrestricted(true);
        for entity in ["user", "order", "sealed", "a", "country", "unknown"] {
            for kind in PermissionKind::ALL_KINDS {
                assert!(c.compile(Some(&admin), entity, kind).is_allow_all());
            }
        }
    }

    #[test]
    fn absent_principal_is_always_denied() {
        let c = compiler();
        for entity in ["user", "order", "country", "unknown"] {
            for kind in PermissionKind::ALL_KINDS {
                assert!(c.compile(None, entity, kind).is_deny_all());
            }
        }
    }

    #[test]
    fn ungoverned_types_are_allowed() {
        let c = compiler();
        assert!(c.compile(Some(&user(2)), "country", PermissionKind::Delete).is_allow_all());
        assert!(c.compile(Some(&user(2)), "unknown", PermissionKind::Read).is_allow_all());
    }

    #[traced_test]
    #[test]
    fn governed_type_without_rules_is_denied() {
        let expr = compiler().compile(Some(&user(2)), "sealed", PermissionKind::Read);
        assert!(expr.is_deny_all());
        assert!(logs_contain("no access rule applies"));
    }

    #[test]
    fn principal_type_gets_self_rule() {
        let expr = compiler().compile(Some(&user(3)), "user", PermissionKind::Update);
        assert_eq!(
            expr,
            AccessExpr::Identity {
                column: "id".to_owned(),
                value: AclValue::Int(3)
            }
        );
    }

    #[test]
    fn order_read_collects_every_rule_in_order() {
        let expr = compiler().compile(Some(&user(1)), "order", PermissionKind::Read);
        let branches = expr.branches();
        assert_eq!(branches.len(), 3);
        assert!(matches!(&branches[0], AccessExpr::OwnerEq { link, .. } if link.join == JoinSpec::Local("owner_id".to_owned())));
        let AccessExpr::GrantLinkEq { permission, owner_column, .. } = &branches[1] else {
            panic!("expected grant link branch, got {:?}", branches[1]);
        };
        assert_eq!(owner_column, "owner_id");
        assert_eq!(permission.as_ref().unwrap().accepted, vec!["read", "all"]);
        assert!(matches!(&branches[2], AccessExpr::ParentDelegate { link, .. } if link.target == "project"));
    }

    #[test]
    fn permission_scoped_parent_is_skipped_for_other_kinds() {
        let expr = compiler().compile(Some(&user(1)), "order", PermissionKind::Update);
        assert_eq!(expr.branches().len(), 2);
        assert!(expr.delegation_paths().is_empty());
    }

    #[test]
    fn compilation_is_idempotent() {
        let c = compiler();
        let p = user(4);
        assert_eq!(
            c.compile(Some(&p), "order", PermissionKind::Read),
            c.compile(Some(&p), "order", PermissionKind::Read)
        );
    }

    #[test]
    fn parent_cycle_terminates_without_revisiting_types() {
        let expr = compiler().compile(Some(&user(1)), "a", PermissionKind::Read);
        let paths = expr.delegation_paths();
        assert_eq!(paths, vec![vec!["b".to_owned()]]);
        for path in paths {
            let mut seen = vec!["a".to_owned()];
            for t in path {
                assert!(!seen.contains(&t), "type {t} visited twice");
                seen.push(t);
            }
        }
    }
}
