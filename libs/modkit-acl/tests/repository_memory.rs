#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Repository behaviour over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use modkit_acl::{
    AclError, AclRepository, Filter, FindOptions, MemoryStore, MetadataRegistry, PageRequest,
    Record, SortOrder,
};
use modkit_security::{
    AclValue, PermissionKind, Principal, PrincipalResolver, StaticPrincipalResolver,
    TaskLocalPrincipalResolver, with_principal,
};
use serde_json::{Value, json};

const CONFIG: &str = r"
principal_type: user
entities:
  user:
    table: users
    columns: [id, name]
    acl: {}
  customer:
    table: customers
    columns: [id, owner_id]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
    acl:
      owners: [owner]
  order:
    table: orders
    columns: [id, owner_id, customer_id, total]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
      - { attribute: customer, target: customer, join: { local: customer_id } }
      - { attribute: grants, target: order_grant, join: { remote: order_id } }
    acl:
      owners: [owner]
      parents:
        - { attribute: customer, permissions: [read] }
      grant_links: [grants]
  order_grant:
    table: order_grants
    columns: [id, order_id, user_id, permission]
    grant: { owner_column: user_id, permission_column: permission }
";

struct Fixture {
    registry: Arc<MetadataRegistry>,
    store: Arc<MemoryStore>,
}

impl Fixture {
    async fn new() -> Self {
        let registry = Arc::new(MetadataRegistry::from_yaml_str(CONFIG).unwrap());
        let store = Arc::new(MemoryStore::new(registry.clone()));
        store
            .seed([
                Record::new("user").with("id", 1).with("name", "u1"),
                Record::new("user").with("id", 2).with("name", "u2"),
                Record::new("user").with("id", 3).with("name", "u3"),
                Record::new("customer").with("id", 1).with("owner_id", 3),
                order(5, 1, 10),
                order(6, 2, 20).with("customer_id", 1),
                order(7, 2, 30),
                Record::new("order_grant")
                    .with("id", 1)
                    .with("order_id", 7)
                    .with("user_id", 1)
                    .with("permission", "read"),
            ])
            .await
            .unwrap();
        Self { registry, store }
    }

    fn repo(&self, resolver: impl PrincipalResolver + 'static) -> AclRepository<MemoryStore> {
        AclRepository::new(
            self.registry.clone(),
            "order",
            self.store.clone(),
            Arc::new(resolver),
        )
        .unwrap()
    }

    fn as_user(&self, id: i64) -> AclRepository<MemoryStore> {
        self.repo(StaticPrincipalResolver::for_principal(Principal::new(id)))
    }

    fn as_admin(&self) -> AclRepository<MemoryStore> {
        let admin = Principal::builder(99_i64).role("ROLE_ADMIN").build();
        self.repo(StaticPrincipalResolver::for_principal(admin))
    }
}

fn order(id: i64, owner: i64, total: i64) -> Record {
    Record::new("order")
        .with("id", id)
        .with("owner_id", owner)
        .with("total", total)
}

fn ids(records: &[Record]) -> Vec<i64> {
    records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64))
        .collect()
}

#[tokio::test]
async fn owner_stranger_and_admin_see_different_orders() {
    let fx = Fixture::new().await;

    let found = fx.as_user(1).get_one(5, PermissionKind::Read).await.unwrap();
    assert_eq!(found.get("total"), Some(&json!(10)));

    let err = fx.as_user(2).get_one(5, PermissionKind::Read).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(fx.as_user(2).find_one(5, PermissionKind::Read).await.unwrap().is_none());

    let found = fx.as_admin().get_one(5, PermissionKind::Read).await.unwrap();
    assert_eq!(found.value_of("id"), Some(AclValue::Int(5)));
}

#[tokio::test]
async fn anonymous_callers_see_nothing() {
    let fx = Fixture::new().await;
    let repo = fx.repo(StaticPrincipalResolver::anonymous());
    assert!(repo.find_all(PermissionKind::Read, FindOptions::default()).await.unwrap().is_empty());
    assert_eq!(repo.count(PermissionKind::Read, None).await.unwrap(), 0);
}

#[tokio::test]
async fn grants_and_parents_are_scoped_by_permission() {
    let fx = Fixture::new().await;

    // user 1: owns 5, holds a read grant on 7
    let repo = fx.as_user(1);
    let read = repo.find_all(PermissionKind::Read, FindOptions::default()).await.unwrap();
    assert_eq!(ids(&read), vec![5, 7]);
    let deletable = repo.find_all(PermissionKind::Delete, FindOptions::default()).await.unwrap();
    assert_eq!(ids(&deletable), vec![5]);

    // user 3: owns customer 1, which is a read-only parent of order 6
    let repo = fx.as_user(3);
    assert!(repo.exists(6).await.unwrap());
    assert!(repo.find_one(6, PermissionKind::Update).await.unwrap().is_none());
}

#[tokio::test]
async fn listing_honours_filter_sort_and_page() {
    let fx = Fixture::new().await;
    let repo = fx.as_user(2);

    let all = repo.find_all(PermissionKind::Read, FindOptions::default()).await.unwrap();
    assert_eq!(ids(&all), vec![6, 7]);

    let by_total = repo
        .find_all(
            PermissionKind::Read,
            FindOptions::default().sort(SortOrder::desc("total")),
        )
        .await
        .unwrap();
    assert_eq!(ids(&by_total), vec![7, 6]);

    let page = repo
        .find_all(
            PermissionKind::Read,
            FindOptions::default().page(PageRequest::new(1, 1)),
        )
        .await
        .unwrap();
    assert_eq!(ids(&page), vec![7]);

    let filtered = repo
        .find_all(
            PermissionKind::Read,
            FindOptions::default().filter(Filter::eq("total", 30)),
        )
        .await
        .unwrap();
    assert_eq!(ids(&filtered), vec![7]);

    let subset = repo
        .find_all_by_ids(vec![AclValue::Int(5), AclValue::Int(6)], PermissionKind::Read)
        .await
        .unwrap();
    assert_eq!(ids(&subset), vec![6]);

    assert_eq!(
        repo.count(PermissionKind::Read, Some(Filter::eq("total", 20))).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn missing_and_inaccessible_rows_look_the_same() {
    let fx = Fixture::new().await;
    let repo = fx.as_user(2);

    assert!(repo.find_one(404, PermissionKind::Delete).await.unwrap().is_none());
    assert!(repo.find_one(5, PermissionKind::Delete).await.unwrap().is_none());

    let missing = repo.delete(404).await.unwrap_err();
    let hidden = repo.delete(5).await.unwrap_err();
    assert!(missing.is_not_found());
    assert!(hidden.is_not_found());
    assert_eq!(fx.store.snapshot("order").await.len(), 3);
}

#[tokio::test]
async fn create_is_checked_against_the_candidate() {
    let fx = Fixture::new().await;
    let repo = fx.as_user(1);

    let created = repo.save(Record::new("order").with("owner_id", 1).with("total", 1)).await.unwrap();
    assert!(created.value_of("id").is_some());
    assert!(repo.can_be_created(&Record::new("order").with("owner_id", 1)).await.unwrap());

    let err = repo
        .save(Record::new("order").with("owner_id", 2).with("total", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AclError::Denied { kind: PermissionKind::Create, .. }));
    assert_eq!(fx.store.snapshot("order").await.len(), 4);
}

#[tokio::test]
async fn update_requires_update_permission() {
    let fx = Fixture::new().await;

    let saved = fx
        .as_user(1)
        .save(Record::new("order").with("id", 5).with("total", 11))
        .await
        .unwrap();
    assert_eq!(saved.get("owner_id"), Some(&json!(1)));
    assert_eq!(saved.get("total"), Some(&json!(11)));

    // a read grant does not allow writes
    let err = fx
        .as_user(1)
        .save(Record::new("order").with("id", 7).with("total", 0))
        .await
        .unwrap_err();
    assert!(err.is_denied());

    let stored = fx.as_admin().get_one(7, PermissionKind::Read).await.unwrap();
    assert_eq!(stored.get("total"), Some(&json!(30)));
}

#[tokio::test]
async fn queued_changes_cannot_authorize_themselves() {
    let fx = Fixture::new().await;
    let repo = fx.as_user(2);
    let mut session = repo.session().await.unwrap();

    session
        .save_without_permission_check(Record::new("order").with("id", 5).with("owner_id", 2))
        .await
        .unwrap();
    let err = session
        .save(Record::new("order").with("id", 5).with("total", 0))
        .await
        .unwrap_err();
    assert!(err.is_denied());
    session.rollback().await.unwrap();

    let stored = fx.as_admin().get_one(5, PermissionKind::Read).await.unwrap();
    assert_eq!(stored.get("owner_id"), Some(&json!(1)));
}

#[tokio::test]
async fn concurrent_save_sees_committed_ownership() {
    for transfer_commits in [true, false] {
        let fx = Fixture::new().await;
        let owner = fx.as_user(1);
        let newcomer = Arc::new(fx.as_user(2));

        let mut transfer = owner.session().await.unwrap();
        transfer
            .save(Record::new("order").with("id", 5).with("owner_id", 2))
            .await
            .unwrap();

        let contender = {
            let repo = newcomer.clone();
            tokio::spawn(async move {
                repo.save(Record::new("order").with("id", 5).with("total", 99)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        if transfer_commits {
            transfer.commit().await.unwrap();
        } else {
            transfer.rollback().await.unwrap();
        }

        let outcome = contender.await.unwrap();
        let stored = fx.as_admin().get_one(5, PermissionKind::Read).await.unwrap();
        if transfer_commits {
            assert_eq!(outcome.unwrap().get("total"), Some(&json!(99)));
            assert_eq!(stored.get("owner_id"), Some(&json!(2)));
        } else {
            assert!(outcome.unwrap_err().is_denied());
            assert_eq!(stored.get("total"), Some(&json!(10)));
        }
    }
}

#[tokio::test]
async fn batch_deletes_skip_inaccessible_rows() {
    let fx = Fixture::new().await;

    let removed = fx
        .as_user(2)
        .delete_all_by_ids(vec![AclValue::Int(5), AclValue::Int(6), AclValue::Int(404)])
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let removed = fx.as_user(1).delete_all().await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(ids(&fx.store.snapshot("order").await), vec![7]);

    fx.as_user(1).delete_without_permission_check(7).await.unwrap();
    let err = fx.as_user(1).delete_without_permission_check(7).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn disabled_enforcement_bypasses_every_check() {
    let fx = Fixture::new().await;
    let repo = fx
        .repo(StaticPrincipalResolver::anonymous())
        .with_enforcement(false);
    assert!(!repo.is_enforced());

    assert_eq!(repo.count(PermissionKind::Read, None).await.unwrap(), 3);
    repo.save(Record::new("order").with("owner_id", 42)).await.unwrap();
    assert_eq!(repo.delete_all().await.unwrap(), 4);
}

#[tokio::test]
async fn unchecked_reads_and_saves() {
    let fx = Fixture::new().await;
    let repo = fx.as_user(2);

    assert!(repo.find_one_without_permission_check(5).await.unwrap().is_some());
    let all = repo.find_all_without_permission_check(FindOptions::default()).await.unwrap();
    assert_eq!(ids(&all), vec![5, 6, 7]);

    // an identifier that is not stored yet is inserted
    let inserted = repo
        .save_without_permission_check(order(50, 9, 1))
        .await
        .unwrap();
    assert_eq!(inserted.value_of("id"), Some(AclValue::Int(50)));
    assert_eq!(fx.store.snapshot("order").await.len(), 4);
}

#[tokio::test]
async fn records_of_other_types_are_rejected() {
    let fx = Fixture::new().await;
    let err = fx.as_admin().save(Record::new("user")).await.unwrap_err();
    assert!(matches!(err, AclError::Invalid(_)));
}

#[tokio::test]
async fn principal_is_resolved_from_the_calling_task() {
    let fx = Fixture::new().await;
    let repo = fx.repo(TaskLocalPrincipalResolver::default());

    let visible = with_principal(Some(Principal::new(1)), async {
        repo.find_all(PermissionKind::Read, FindOptions::default()).await
    })
    .await
    .unwrap();
    assert_eq!(ids(&visible), vec![5, 7]);

    let outside = repo.find_all(PermissionKind::Read, FindOptions::default()).await.unwrap();
    assert!(outside.is_empty());
}

#[tokio::test]
async fn self_rule_exposes_only_the_principal_row() {
    let fx = Fixture::new().await;
    let users = AclRepository::new(
        fx.registry.clone(),
        "user",
        fx.store.clone(),
        Arc::new(StaticPrincipalResolver::for_principal(Principal::new(2))),
    )
    .unwrap();
    let visible = users.find_all(PermissionKind::Read, FindOptions::default()).await.unwrap();
    assert_eq!(ids(&visible), vec![2]);
}
