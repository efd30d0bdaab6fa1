//! Permission-aware repository.
//!
//! Every checked operation compiles the principal's access predicate for the
//! operation's permission kind and applies it inside one store transaction:
//!
//! | Operation | Kind | Outcome when not permitted |
//! |-----------|------|----------------------------|
//! | `find_one` / `find_all` / `count` | caller-chosen | row absent |
//! | `get_one` | caller-chosen | `NotFound` |
//! | `save` (new record) | `create` | `Denied`, nothing inserted |
//! | `save` (existing record) | `update` | `Denied`, nothing written |
//! | `delete` | `delete` | `NotFound` |
//! | `delete_all*` | `delete` | inaccessible rows are skipped |
//!
//! The `*_without_permission_check` variants skip compilation entirely and
//! are meant for trusted internal flows that already made an authorization
//! decision.

use std::sync::Arc;

use modkit_security::{AclValue, PermissionKind, Principal, PrincipalResolver};
use tracing::{debug, instrument, warn};

use crate::check::evaluate_candidate;
use crate::compiler::PredicateCompiler;
use crate::error::AclError;
use crate::expr::{AccessExpr, Filter};
use crate::metadata::{EntityMeta, MetadataRegistry};
use crate::query::{PageRequest, SelectQuery, SortOrder, Visibility};
use crate::record::Record;
use crate::store::{AclStore, StoreTx};

/// Caller-supplied constraints for collection queries.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub filter: Option<Filter>,
    /// Explicit order. When empty, rows are ordered by ascending identifier.
    pub sort: Vec<SortOrder>,
    pub page: Option<PageRequest>,
}

impl FindOptions {
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn sort(mut self, order: SortOrder) -> Self {
        self.sort.push(order);
        self
    }

    #[must_use]
    pub fn page(mut self, page: PageRequest) -> Self {
        self.page = Some(page);
        self
    }
}

/// Repository for one entity type.
///
/// Plain calls open a session, run the operation and commit; use
/// [`session`](Self::session) to run several operations in one transaction.
pub struct AclRepository<S: AclStore> {
    entity: Arc<EntityMeta>,
    compiler: PredicateCompiler,
    store: Arc<S>,
    resolver: Arc<dyn PrincipalResolver>,
    enforce: bool,
}

impl<S: AclStore> AclRepository<S> {
    /// # Errors
    /// Returns [`AclError::Configuration`] when `entity_type` is not declared.
    pub fn new(
        registry: Arc<MetadataRegistry>,
        entity_type: &str,
        store: Arc<S>,
        resolver: Arc<dyn PrincipalResolver>,
    ) -> Result<Self, AclError> {
        let entity = Arc::clone(registry.entity(entity_type)?);
        Ok(Self {
            entity,
            compiler: PredicateCompiler::new(registry),
            store,
            resolver,
            enforce: true,
        })
    }

    /// Toggle access control. A repository without enforcement routes every
    /// operation to its unchecked counterpart.
    #[must_use]
    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    #[must_use]
    pub fn entity(&self) -> &EntityMeta {
        &self.entity
    }

    #[must_use]
    pub fn is_enforced(&self) -> bool {
        self.enforce
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        self.compiler.registry()
    }

    /// Open a unit of work bound to the current principal.
    ///
    /// A principal holding one of the registry's admin roles is unrestricted
    /// in addition to whatever the resolver decided.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] when the transaction cannot be started.
    pub async fn session(&self) -> Result<AclSession<'_, S>, AclError> {
        let tx = self.store.begin().await?;
        let principal = self.resolver.resolve().map(|p| {
            let admin = self.registry().admin_roles().iter().any(|r| p.has_role(r));
            let unrestricted = p.is_unrestricted() || admin;
            p.with_unrestricted(unrestricted)
        });
        Ok(AclSession {
            repo: self,
            tx,
            principal,
        })
    }

    /// See [`AclSession::find_one`].
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_one(
        &self,
        id: impl Into<AclValue>,
        kind: PermissionKind,
    ) -> Result<Option<Record>, AclError> {
        let mut session = self.session().await?;
        let result = session.find_one(id, kind).await;
        session.finish(result).await
    }

    /// See [`AclSession::get_one`].
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the row is absent or inaccessible.
    pub async fn get_one(&self, id: impl Into<AclValue>, kind: PermissionKind) -> Result<Record, AclError> {
        let mut session = self.session().await?;
        let result = session.get_one(id, kind).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_one_without_permission_check(
        &self,
        id: impl Into<AclValue>,
    ) -> Result<Option<Record>, AclError> {
        let mut session = self.session().await?;
        let result = session.find_one_without_permission_check(id).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn exists(&self, id: impl Into<AclValue>) -> Result<bool, AclError> {
        let mut session = self.session().await?;
        let result = session.exists(id).await;
        session.finish(result).await
    }

    /// See [`AclSession::find_all`].
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_all(
        &self,
        kind: PermissionKind,
        options: FindOptions,
    ) -> Result<Vec<Record>, AclError> {
        let mut session = self.session().await?;
        let result = session.find_all(kind, options).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_all_without_permission_check(
        &self,
        options: FindOptions,
    ) -> Result<Vec<Record>, AclError> {
        let mut session = self.session().await?;
        let result = session.find_all_without_permission_check(options).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_all_by_ids(
        &self,
        ids: Vec<AclValue>,
        kind: PermissionKind,
    ) -> Result<Vec<Record>, AclError> {
        let mut session = self.session().await?;
        let result = session.find_all_by_ids(ids, kind).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn count(&self, kind: PermissionKind, filter: Option<Filter>) -> Result<u64, AclError> {
        let mut session = self.session().await?;
        let result = session.count(kind, filter).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn can_be_created(&self, record: &Record) -> Result<bool, AclError> {
        let mut session = self.session().await?;
        let result = session.can_be_created(record).await;
        session.finish(result).await
    }

    /// See [`AclSession::save`].
    ///
    /// # Errors
    /// Returns [`AclError::Denied`] when the principal may not create or
    /// update the record.
    pub async fn save(&self, record: Record) -> Result<Record, AclError> {
        let mut session = self.session().await?;
        let result = session.save(record).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn save_without_permission_check(&self, record: Record) -> Result<Record, AclError> {
        let mut session = self.session().await?;
        let result = session.save_without_permission_check(record).await;
        session.finish(result).await
    }

    /// See [`AclSession::delete`].
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the row is absent or inaccessible.
    pub async fn delete(&self, id: impl Into<AclValue>) -> Result<(), AclError> {
        let mut session = self.session().await?;
        let result = session.delete(id).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::NotFound`] when the row does not exist.
    pub async fn delete_without_permission_check(&self, id: impl Into<AclValue>) -> Result<(), AclError> {
        let mut session = self.session().await?;
        let result = session.delete_without_permission_check(id).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn delete_all_by_ids(&self, ids: Vec<AclValue>) -> Result<u64, AclError> {
        let mut session = self.session().await?;
        let result = session.delete_all_by_ids(ids).await;
        session.finish(result).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn delete_all(&self) -> Result<u64, AclError> {
        let mut session = self.session().await?;
        let result = session.delete_all().await;
        session.finish(result).await
    }
}

/// A unit of work over one store transaction.
///
/// The principal is resolved once when the session opens. Dropping a session
/// without [`commit`](Self::commit) discards its changes.
pub struct AclSession<'r, S: AclStore> {
    repo: &'r AclRepository<S>,
    tx: S::Tx,
    principal: Option<Principal>,
}

impl<S: AclStore> AclSession<'_, S> {
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// The predicate restricting this repository's rows under `kind`.
    #[must_use]
    pub fn access_filter(&self, kind: PermissionKind) -> AccessExpr {
        self.filter_for(&self.repo.entity.name, kind)
    }

    pub(crate) fn filter_for(&self, entity_type: &str, kind: PermissionKind) -> AccessExpr {
        if !self.repo.enforce {
            return AccessExpr::allow_all();
        }
        self.repo
            .compiler
            .compile(self.principal.as_ref(), entity_type, kind)
    }

    fn name(&self) -> &str {
        &self.repo.entity.name
    }

    fn id_of(&self, record: &Record) -> Option<AclValue> {
        record.value_of(&self.repo.entity.id_column)
    }

    fn ensure_type(&self, record: &Record) -> Result<(), AclError> {
        if record.entity_type() == self.name() {
            Ok(())
        } else {
            Err(AclError::Invalid(format!(
                "record of type '{}' passed to the '{}' repository",
                record.entity_type(),
                self.name()
            )))
        }
    }

    fn id_query(&self, id: &AclValue, access: AccessExpr, visibility: Visibility) -> SelectQuery {
        let by_id = Filter::eq(self.repo.entity.id_column.clone(), id.clone());
        let query = SelectQuery::new(self.name(), AccessExpr::and([access, by_id.into()]))
            .page(Some(PageRequest::first(1)));
        // Committed reads precede a write to the same row: keep it locked
        // until the session ends.
        if visibility == Visibility::Committed {
            query.for_update()
        } else {
            query
        }
    }

    async fn lookup(
        &mut self,
        id: &AclValue,
        access: AccessExpr,
        visibility: Visibility,
    ) -> Result<Option<Record>, AclError> {
        let query = self.id_query(id, access, visibility);
        Ok(self.tx.select(&query, visibility).await?.into_iter().next())
    }

    async fn select_with(
        &mut self,
        access: AccessExpr,
        options: FindOptions,
    ) -> Result<Vec<Record>, AclError> {
        let condition = AccessExpr::and([access, options.filter.map_or(AccessExpr::allow_all(), AccessExpr::from)]);
        let order = if options.sort.is_empty() {
            vec![SortOrder::asc(self.repo.entity.id_column.clone())]
        } else {
            options.sort
        };
        let query = SelectQuery::new(self.name(), condition)
            .order_by(order)
            .page(options.page);
        Ok(self.tx.select(&query, Visibility::Pending).await?)
    }

    /// The row with `id` if the principal holds `kind` on it.
    ///
    /// Absent and inaccessible rows are indistinguishable.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity.name, %kind))]
    pub async fn find_one(
        &mut self,
        id: impl Into<AclValue>,
        kind: PermissionKind,
    ) -> Result<Option<Record>, AclError> {
        let id = id.into();
        let access = self.access_filter(kind);
        let found = self.lookup(&id, access, Visibility::Pending).await?;
        if found.is_none() {
            debug!(%id, "no accessible row");
        }
        Ok(found)
    }

    /// Like [`find_one`](Self::find_one), failing when there is no accessible row.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the row is absent or inaccessible.
    pub async fn get_one(&mut self, id: impl Into<AclValue>, kind: PermissionKind) -> Result<Record, AclError> {
        let id = id.into();
        self.find_one(id.clone(), kind)
            .await?
            .ok_or_else(|| AclError::not_found(self.name(), &id))
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_one_without_permission_check(
        &mut self,
        id: impl Into<AclValue>,
    ) -> Result<Option<Record>, AclError> {
        let id = id.into();
        self.lookup(&id, AccessExpr::allow_all(), Visibility::Pending).await
    }

    /// Whether the row exists and is readable.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn exists(&mut self, id: impl Into<AclValue>) -> Result<bool, AclError> {
        Ok(self.find_one(id, PermissionKind::Read).await?.is_some())
    }

    /// Rows the principal holds `kind` on, restricted by `options`.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity.name, %kind))]
    pub async fn find_all(
        &mut self,
        kind: PermissionKind,
        options: FindOptions,
    ) -> Result<Vec<Record>, AclError> {
        let access = self.access_filter(kind);
        self.select_with(access, options).await
    }

    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_all_without_permission_check(
        &mut self,
        options: FindOptions,
    ) -> Result<Vec<Record>, AclError> {
        self.select_with(AccessExpr::allow_all(), options).await
    }

    /// Accessible rows among `ids`.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn find_all_by_ids(
        &mut self,
        ids: Vec<AclValue>,
        kind: PermissionKind,
    ) -> Result<Vec<Record>, AclError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::is_in(self.repo.entity.id_column.clone(), ids);
        self.find_all(kind, FindOptions::default().filter(filter)).await
    }

    /// Number of rows the principal holds `kind` on.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn count(&mut self, kind: PermissionKind, filter: Option<Filter>) -> Result<u64, AclError> {
        let access = self.access_filter(kind);
        let condition = AccessExpr::and([access, filter.map_or(AccessExpr::allow_all(), AccessExpr::from)]);
        let name = self.repo.entity.name.clone();
        Ok(self.tx.count(&name, &condition).await?)
    }

    /// Whether the principal may create `record`.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] when a linked row cannot be queried.
    pub async fn can_be_created(&mut self, record: &Record) -> Result<bool, AclError> {
        let expr = self.access_filter(PermissionKind::Create);
        Ok(evaluate_candidate(&mut self.tx, &expr, record).await?)
    }

    /// Insert a new record or update an existing one.
    ///
    /// A record without an identifier is new and must pass the `create`
    /// check. Otherwise the stored row must be updatable by the principal;
    /// the check reads with [`Visibility::Committed`] so changes queued in
    /// this session, including the record being saved, cannot grant access
    /// to themselves. The checked row stays locked (`FOR UPDATE` on SQL
    /// stores) until the session commits or rolls back.
    ///
    /// # Errors
    /// Returns [`AclError::Denied`] when the check fails; nothing is written.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity.name))]
    pub async fn save(&mut self, record: Record) -> Result<Record, AclError> {
        self.ensure_type(&record)?;
        if !self.repo.enforce {
            return self.save_without_permission_check(record).await;
        }

        let Some(id) = self.id_of(&record) else {
            if !self.can_be_created(&record).await? {
                debug!("create denied");
                return Err(AclError::denied(self.name(), PermissionKind::Create));
            }
            return Ok(self.tx.insert(record).await?);
        };

        let access = self.access_filter(PermissionKind::Update);
        if self.lookup(&id, access, Visibility::Committed).await?.is_none() {
            debug!(%id, "update denied");
            return Err(AclError::denied(self.name(), PermissionKind::Update));
        }
        Ok(self.tx.update(record).await?)
    }

    /// Insert or update without any access check. A record carrying an
    /// identifier that is not stored yet is inserted.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    pub async fn save_without_permission_check(&mut self, record: Record) -> Result<Record, AclError> {
        self.ensure_type(&record)?;
        match self.id_of(&record) {
            Some(id) if self.lookup(&id, AccessExpr::allow_all(), Visibility::Committed).await?.is_some() => {
                Ok(self.tx.update(record).await?)
            }
            _ => Ok(self.tx.insert(record).await?),
        }
    }

    /// Delete the row if the principal holds `delete` on it.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the row is absent or inaccessible.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity.name))]
    pub async fn delete(&mut self, id: impl Into<AclValue>) -> Result<(), AclError> {
        let id = id.into();
        if self.find_one(id.clone(), PermissionKind::Delete).await?.is_none() {
            return Err(AclError::not_found(self.name(), &id));
        }
        let name = self.repo.entity.name.clone();
        self.tx.delete(&name, Some(std::slice::from_ref(&id))).await?;
        Ok(())
    }

    /// # Errors
    /// Returns [`AclError::NotFound`] when the row does not exist.
    pub async fn delete_without_permission_check(&mut self, id: impl Into<AclValue>) -> Result<(), AclError> {
        let id = id.into();
        let name = self.repo.entity.name.clone();
        if self.tx.delete(&name, Some(std::slice::from_ref(&id))).await? == 0 {
            return Err(AclError::not_found(&name, &id));
        }
        Ok(())
    }

    /// Delete the rows among `ids` the principal holds `delete` on; without
    /// enforcement every listed row is deleted. Returns the number removed.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity.name, requested = ids.len()))]
    pub async fn delete_all_by_ids(&mut self, ids: Vec<AclValue>) -> Result<u64, AclError> {
        let name = self.repo.entity.name.clone();
        if !self.repo.enforce {
            return Ok(self.tx.delete(&name, Some(ids.as_slice())).await?);
        }
        let visible = self.find_all_by_ids(ids, PermissionKind::Delete).await?;
        self.delete_records(&name, &visible).await
    }

    /// Delete every row the principal holds `delete` on; without enforcement
    /// the whole table is cleared. Returns the number removed.
    ///
    /// # Errors
    /// Returns [`AclError::Storage`] on storage failure.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity.name))]
    pub async fn delete_all(&mut self) -> Result<u64, AclError> {
        let name = self.repo.entity.name.clone();
        if !self.repo.enforce {
            return Ok(self.tx.delete(&name, None).await?);
        }
        let visible = self.find_all(PermissionKind::Delete, FindOptions::default()).await?;
        self.delete_records(&name, &visible).await
    }

    async fn delete_records(&mut self, name: &str, records: &[Record]) -> Result<u64, AclError> {
        let ids: Vec<AclValue> = records.iter().filter_map(|r| self.id_of(r)).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.tx.delete(name, Some(&ids)).await?;
        debug!(removed, "batch delete");
        Ok(removed)
    }

    /// Rows of another entity type matching `access` and `filter`, ordered by
    /// their identifier.
    pub(crate) async fn select_related(
        &mut self,
        entity_type: &str,
        access: AccessExpr,
        filter: Filter,
    ) -> Result<Vec<Record>, AclError> {
        let target = self.repo.registry().entity(entity_type)?;
        let query = SelectQuery::new(entity_type, AccessExpr::and([access, filter.into()]))
            .order_by(vec![SortOrder::asc(target.id_column.clone())]);
        Ok(self.tx.select(&query, Visibility::Pending).await?)
    }

    /// Write `record` of any entity type without an access check.
    pub(crate) async fn update_unchecked(&mut self, record: Record) -> Result<Record, AclError> {
        Ok(self.tx.update(record).await?)
    }

    /// # Errors
    /// Returns [`AclError::Storage`] when the commit fails.
    pub async fn commit(self) -> Result<(), AclError> {
        Ok(self.tx.commit().await?)
    }

    /// # Errors
    /// Returns [`AclError::Storage`] when the rollback fails.
    pub async fn rollback(self) -> Result<(), AclError> {
        Ok(self.tx.rollback().await?)
    }

    /// Commit on success, roll back on failure, and hand back `result`.
    pub(crate) async fn finish<T>(self, result: Result<T, AclError>) -> Result<T, AclError> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback().await {
                    warn!(error = %rollback, "rollback after failed operation failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::sql::select_statement;
    use crate::store::MemoryStore;
    use modkit_security::StaticPrincipalResolver;
    use sea_orm::sea_query::PostgresQueryBuilder;

    const CONFIG: &str = r"
entities:
  user: { table: users, columns: [id] }
  task:
    table: tasks
    columns: [id, owner_id]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
    acl: { owners: [owner] }
";

    fn repository() -> AclRepository<MemoryStore> {
        let registry = Arc::new(MetadataRegistry::from_yaml_str(CONFIG).unwrap());
        let store = Arc::new(MemoryStore::new(registry.clone()));
        let resolver = Arc::new(StaticPrincipalResolver::for_principal(Principal::new(10)));
        AclRepository::new(registry, "task", store, resolver).unwrap()
    }

    #[tokio::test]
    async fn update_check_locks_the_row() {
        let repo = repository();
        let session = repo.session().await.unwrap();
        let id = AclValue::Int(1);

        let check = session.id_query(&id, session.access_filter(PermissionKind::Update), Visibility::Committed);
        assert!(check.lock);
        let sql = select_statement(repo.entity(), &check).to_string(PostgresQueryBuilder);
        assert!(sql.ends_with(r#"FOR UPDATE OF "t0""#), "{sql}");
        assert!(sql.contains(r#""t0"."owner_id" = 10"#), "{sql}");

        let read = session.id_query(&id, session.access_filter(PermissionKind::Read), Visibility::Pending);
        assert!(!read.lock);
        session.rollback().await.unwrap();
    }
}
