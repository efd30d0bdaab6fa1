//! Nested relation access for the REST-facing layer.
//!
//! Each operation first runs a checked lookup on the owning row, `read` for
//! reads and `update` for mutations, and only then touches the relation through
//! unchecked writes. The lookup and the write share one session.

use modkit_security::{AclValue, PermissionKind};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::AclError;
use crate::expr::Filter;
use crate::metadata::{JoinSpec, Link};
use crate::record::Record;
use crate::repository::{AclRepository, AclSession};
use crate::store::AclStore;

pub struct SubResourceGateway<'r, S: AclStore> {
    repo: &'r AclRepository<S>,
}

impl<'r, S: AclStore> SubResourceGateway<'r, S> {
    #[must_use]
    pub fn new(repo: &'r AclRepository<S>) -> Self {
        Self { repo }
    }

    fn link(&self, attribute: &str) -> Result<Link, AclError> {
        let entity = self.repo.entity();
        self.repo.registry().link(entity, attribute).ok_or_else(|| {
            AclError::Invalid(format!(
                "'{}' has no relation '{attribute}'",
                entity.name
            ))
        })
    }

    fn identifier(&self, owner: &Record) -> Result<AclValue, AclError> {
        owner
            .value_of(&self.repo.entity().id_column)
            .ok_or_else(|| AclError::Invalid(format!("stored '{}' row without identifier", self.repo.entity().name)))
    }

    /// The target row with `id` if it is readable, else `NotFound`.
    async fn readable_target(
        session: &mut AclSession<'_, S>,
        link: &Link,
        id: &AclValue,
        extra: Option<Filter>,
    ) -> Result<Record, AclError> {
        let by_id = Filter::eq(link.target_id.clone(), id.clone());
        let filter = match extra {
            Some(extra) => Filter::All(vec![by_id, extra]),
            None => by_id,
        };
        let access = session.filter_for(&link.target, PermissionKind::Read);
        session
            .select_related(&link.target, access, filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AclError::not_found(&link.target, id))
    }

    /// Rows reachable through `attribute` of the owner, restricted to those the
    /// principal may read.
    ///
    /// A single-valued reference yields its one target.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the owner is absent or unreadable,
    /// or when a reference is unset or points at an unreadable row, and
    /// [`AclError::Invalid`] for an undeclared attribute.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity().name, attribute = %attribute))]
    pub async fn read_relation(
        &self,
        owner_id: impl Into<AclValue>,
        attribute: &str,
    ) -> Result<Vec<Record>, AclError> {
        let link = self.link(attribute)?;
        let mut session = self.repo.session().await?;
        let result = self.read_in(&mut session, owner_id.into(), &link).await;
        session.finish(result).await
    }

    async fn read_in(
        &self,
        session: &mut AclSession<'_, S>,
        owner_id: AclValue,
        link: &Link,
    ) -> Result<Vec<Record>, AclError> {
        let owner = session.get_one(owner_id.clone(), PermissionKind::Read).await?;
        match &link.join {
            JoinSpec::Local(fk) => {
                let target_id = self.reference_of(&owner, link, fk, &owner_id)?;
                Ok(vec![Self::readable_target(session, link, &target_id, None).await?])
            }
            JoinSpec::Remote(fk) => {
                let filter = Filter::eq(fk.clone(), self.identifier(&owner)?);
                let access = session.filter_for(&link.target, PermissionKind::Read);
                session.select_related(&link.target, access, filter).await
            }
        }
    }

    /// Target of the owner's reference `fk`; an unset reference is `NotFound`.
    fn reference_of(
        &self,
        owner: &Record,
        link: &Link,
        fk: &str,
        owner_id: &AclValue,
    ) -> Result<AclValue, AclError> {
        owner.value_of(fk).ok_or_else(|| {
            AclError::not_found(
                &format!("{}.{}", self.repo.entity().name, link.attribute),
                owner_id,
            )
        })
    }

    /// The single related row `item_id` reached through `attribute`.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the owner is absent or unreadable,
    /// or when `item_id` is not related to the owner or not readable, and
    /// [`AclError::Invalid`] for an undeclared attribute.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity().name, attribute = %attribute))]
    pub async fn read_relation_item(
        &self,
        owner_id: impl Into<AclValue>,
        attribute: &str,
        item_id: impl Into<AclValue>,
    ) -> Result<Record, AclError> {
        let link = self.link(attribute)?;
        let mut session = self.repo.session().await?;
        let result = self
            .read_item_in(&mut session, owner_id.into(), &link, &item_id.into())
            .await;
        session.finish(result).await
    }

    async fn read_item_in(
        &self,
        session: &mut AclSession<'_, S>,
        owner_id: AclValue,
        link: &Link,
        item_id: &AclValue,
    ) -> Result<Record, AclError> {
        let owner = session.get_one(owner_id.clone(), PermissionKind::Read).await?;
        match &link.join {
            JoinSpec::Local(fk) => {
                if self.reference_of(&owner, link, fk, &owner_id)? != *item_id {
                    return Err(AclError::not_found(&link.target, item_id));
                }
                Self::readable_target(session, link, item_id, None).await
            }
            JoinSpec::Remote(fk) => {
                let membership = Filter::eq(fk.clone(), self.identifier(&owner)?);
                Self::readable_target(session, link, item_id, Some(membership)).await
            }
        }
    }

    /// Point the single-valued relation `attribute` at `target_id`, or clear it.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the owner is not updatable or the
    /// target is not readable, and [`AclError::Invalid`] when `attribute` is
    /// not a local reference.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity().name, attribute = %attribute))]
    pub async fn set_reference(
        &self,
        owner_id: impl Into<AclValue>,
        attribute: &str,
        target_id: Option<AclValue>,
    ) -> Result<Record, AclError> {
        let link = self.link(attribute)?;
        let JoinSpec::Local(fk) = &link.join else {
            return Err(AclError::Invalid(format!(
                "'{attribute}' is a collection, not a reference"
            )));
        };
        let mut session = self.repo.session().await?;
        let result = self
            .set_in(&mut session, owner_id.into(), &link, fk, target_id.as_ref())
            .await;
        session.finish(result).await
    }

    async fn set_in(
        &self,
        session: &mut AclSession<'_, S>,
        owner_id: AclValue,
        link: &Link,
        fk: &str,
        target_id: Option<&AclValue>,
    ) -> Result<Record, AclError> {
        let owner = session.get_one(owner_id, PermissionKind::Update).await?;
        let value = match target_id {
            Some(id) => {
                Self::readable_target(session, link, id, None).await?;
                id.to_json()
            }
            None => Value::Null,
        };
        let entity = self.repo.entity();
        let change = Record::new(entity.name.clone())
            .with(entity.id_column.clone(), self.identifier(&owner)?.to_json())
            .with(fk, value);
        session.save_without_permission_check(change).await
    }

    /// Attach the child `child_id` to the owner through the collection
    /// `attribute`.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the owner is not updatable or the
    /// child is not readable, and [`AclError::Invalid`] when `attribute` is not
    /// a collection.
    pub async fn add_to_collection(
        &self,
        owner_id: impl Into<AclValue>,
        attribute: &str,
        child_id: impl Into<AclValue>,
    ) -> Result<Record, AclError> {
        self.repoint_child(owner_id.into(), attribute, child_id.into(), true)
            .await
    }

    /// Detach the child `child_id` from the owner's collection `attribute`.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the owner is not updatable or the
    /// child is not a readable member of the collection, and
    /// [`AclError::Invalid`] when `attribute` is not a collection.
    pub async fn remove_from_collection(
        &self,
        owner_id: impl Into<AclValue>,
        attribute: &str,
        child_id: impl Into<AclValue>,
    ) -> Result<Record, AclError> {
        self.repoint_child(owner_id.into(), attribute, child_id.into(), false)
            .await
    }

    /// Make `child_ids` the owner's whole collection `attribute`.
    ///
    /// Every listed child must be readable; readable members that are not
    /// listed are detached. Members the principal cannot read are left alone.
    /// Returns the listed children after the change, in the given order.
    ///
    /// # Errors
    /// Returns [`AclError::NotFound`] when the owner is not updatable or a
    /// listed child is not readable, in which case nothing changes, and
    /// [`AclError::Invalid`] when `attribute` is not a collection.
    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity().name, attribute = %attribute, children = child_ids.len()))]
    pub async fn replace_collection(
        &self,
        owner_id: impl Into<AclValue>,
        attribute: &str,
        child_ids: &[AclValue],
    ) -> Result<Vec<Record>, AclError> {
        let link = self.link(attribute)?;
        let JoinSpec::Remote(fk) = &link.join else {
            return Err(AclError::Invalid(format!(
                "'{attribute}' is a reference, not a collection"
            )));
        };
        let mut session = self.repo.session().await?;
        let result = self
            .replace_in(&mut session, owner_id.into(), &link, fk, child_ids)
            .await;
        session.finish(result).await
    }

    async fn replace_in(
        &self,
        session: &mut AclSession<'_, S>,
        owner_id: AclValue,
        link: &Link,
        fk: &str,
        child_ids: &[AclValue],
    ) -> Result<Vec<Record>, AclError> {
        let owner = session.get_one(owner_id, PermissionKind::Update).await?;
        let owner_key = self.identifier(&owner)?;
        for id in child_ids {
            Self::readable_target(session, link, id, None).await?;
        }

        let access = session.filter_for(&link.target, PermissionKind::Read);
        let current = session
            .select_related(&link.target, access, Filter::eq(fk, owner_key.clone()))
            .await?;
        for member in current {
            let Some(id) = member.value_of(&link.target_id) else {
                continue;
            };
            if child_ids.contains(&id) {
                continue;
            }
            debug!(child = %id, "detaching child");
            let change = Record::new(link.target.clone())
                .with(link.target_id.clone(), id.to_json())
                .with(fk, Value::Null);
            session.update_unchecked(change).await?;
        }

        let mut members = Vec::with_capacity(child_ids.len());
        for id in child_ids {
            let change = Record::new(link.target.clone())
                .with(link.target_id.clone(), id.to_json())
                .with(fk, owner_key.to_json());
            members.push(session.update_unchecked(change).await?);
        }
        Ok(members)
    }

    #[instrument(level = "debug", skip_all, fields(entity = %self.repo.entity().name, attribute = %attribute, attach = attach))]
    async fn repoint_child(
        &self,
        owner_id: AclValue,
        attribute: &str,
        child_id: AclValue,
        attach: bool,
    ) -> Result<Record, AclError> {
        let link = self.link(attribute)?;
        let JoinSpec::Remote(fk) = &link.join else {
            return Err(AclError::Invalid(format!(
                "'{attribute}' is a reference, not a collection"
            )));
        };
        let mut session = self.repo.session().await?;
        let result = Self::repoint_in(&mut session, owner_id, &link, fk, &child_id, attach).await;
        session.finish(result).await
    }

    async fn repoint_in(
        session: &mut AclSession<'_, S>,
        owner_id: AclValue,
        link: &Link,
        fk: &str,
        child_id: &AclValue,
        attach: bool,
    ) -> Result<Record, AclError> {
        let owner = session.get_one(owner_id.clone(), PermissionKind::Update).await?;
        let owner_key = owner.value_of(&link.source_id).unwrap_or(owner_id);
        let membership = (!attach).then(|| Filter::eq(fk, owner_key.clone()));
        Self::readable_target(session, link, child_id, membership).await?;

        let value = if attach { owner_key.to_json() } else { Value::Null };
        let change = Record::new(link.target.clone())
            .with(link.target_id.clone(), child_id.to_json())
            .with(fk, value);
        debug!(child = %child_id, "re-pointing child");
        session.update_unchecked(change).await
    }
}
