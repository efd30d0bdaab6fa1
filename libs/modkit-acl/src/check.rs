//! Point evaluation of a compiled predicate against a record that does not
//! exist in storage yet.
//!
//! Branches reading the candidate's own fields evaluate in memory. Branches
//! that follow a local FK run a query on the target type inside the same
//! transaction. Branches that follow a remote FK can never match: no other
//! row can reference a row that has not been inserted.

use std::future::Future;
use std::pin::Pin;

use modkit_security::AclValue;

use crate::error::StoreError;
use crate::expr::{AccessExpr, Filter, PermissionMatch};
use crate::metadata::{JoinSpec, Link};
use crate::query::{PageRequest, SelectQuery, Visibility};
use crate::record::Record;
use crate::store::StoreTx;

type CheckFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

fn grant_filter(owner_column: &str, value: &AclValue, permission: Option<&PermissionMatch>) -> Filter {
    let mut parts = vec![Filter::eq(owner_column, value.clone())];
    if let Some(p) = permission {
        parts.push(Filter::is_in(p.column.clone(), p.values()));
    }
    Filter::All(parts)
}

/// Whether `candidate` satisfies `expr`.
pub fn evaluate_candidate<'a, T: StoreTx>(
    tx: &'a mut T,
    expr: &'a AccessExpr,
    candidate: &'a Record,
) -> CheckFuture<'a> {
    Box::pin(async move {
        match expr {
            AccessExpr::Const(b) => Ok(*b),
            AccessExpr::Identity { column, value } => {
                Ok(candidate.get(column).is_some_and(|v| value.matches_json(v)))
            }
            AccessExpr::Filter(filter) => Ok(filter.matches(candidate)),
            AccessExpr::OwnerEq { link, value } => match &link.join {
                JoinSpec::Local(fk) => Ok(candidate.get(fk).is_some_and(|v| value.matches_json(v))),
                JoinSpec::Remote(_) => Ok(false),
            },
            AccessExpr::GrantLinkEq {
                link,
                owner_column,
                value,
                permission,
            } => {
                let target_condition = grant_filter(owner_column, value, permission.as_ref()).into();
                linked_row_matches(tx, link, candidate, target_condition).await
            }
            AccessExpr::ParentDelegate { link, expr } => {
                linked_row_matches(tx, link, candidate, expr.as_ref().clone()).await
            }
            AccessExpr::Or(items) => {
                for item in items {
                    if evaluate_candidate(&mut *tx, item, candidate).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            AccessExpr::And(items) => {
                for item in items {
                    if !evaluate_candidate(&mut *tx, item, candidate).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    })
}

async fn linked_row_matches<T: StoreTx>(
    tx: &mut T,
    link: &Link,
    candidate: &Record,
    condition: AccessExpr,
) -> Result<bool, StoreError> {
    let JoinSpec::Local(fk) = &link.join else {
        return Ok(false);
    };
    let Some(target_id) = candidate.value_of(fk) else {
        return Ok(false);
    };
    let query = SelectQuery::new(
        link.target.clone(),
        AccessExpr::and([Filter::eq(link.target_id.clone(), target_id).into(), condition]),
    )
    .page(Some(PageRequest::first(1)));
    Ok(!tx.select(&query, Visibility::Pending).await?.is_empty())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compiler::PredicateCompiler;
    use crate::metadata::MetadataRegistry;
    use crate::store::{AclStore, MemoryStore};
    use modkit_security::{PermissionKind, Principal};

    const CONFIG: &str = r"
entities:
  user: { table: users, columns: [id] }
  project:
    table: projects
    columns: [id, owner_id]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
    acl: { owners: [owner] }
  task:
    table: tasks
    columns: [id, owner_id, project_id]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
      - { attribute: project, target: project, join: { local: project_id } }
      - { attribute: grants, target: task_grant, join: { remote: task_id } }
    acl: { owners: [owner], parents: [project], grant_links: [grants] }
  task_grant:
    table: task_grants
    columns: [id, task_id, owner_id]
    grant: { owner_column: owner_id }
";

    async fn setup() -> (PredicateCompiler, MemoryStore) {
        let registry = Arc::new(MetadataRegistry::from_yaml_str(CONFIG).unwrap());
        let store = MemoryStore::new(registry.clone());
        store
            .seed([
                Record::new("project").with("id", 1).with("owner_id", 10),
                Record::new("project").with("id", 2).with("owner_id", 20),
            ])
            .await
            .unwrap();
        (PredicateCompiler::new(registry), store)
    }

    async fn can_create(principal: i64, candidate: &Record) -> bool {
        let (compiler, store) = setup().await;
        let expr = compiler.compile(Some(&Principal::new(principal)), "task", PermissionKind::Create);
        let mut tx = store.begin().await.unwrap();
        evaluate_candidate(&mut tx, &expr, candidate).await.unwrap()
    }

    #[tokio::test]
    async fn own_candidate_may_be_created() {
        let task = Record::new("task").with("owner_id", 7).with("project_id", 2);
        assert!(can_create(7, &task).await);
    }

    #[tokio::test]
    async fn candidate_under_accessible_parent_may_be_created() {
        let task = Record::new("task").with("owner_id", 99).with("project_id", 1);
        assert!(can_create(10, &task).await);
        assert!(!can_create(20, &task).await);
    }

    #[tokio::test]
    async fn remote_grant_links_never_match_new_rows() {
        let task = Record::new("task").with("owner_id", 99);
        assert!(!can_create(5, &task).await);
    }
}
