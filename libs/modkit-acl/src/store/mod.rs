//! Host storage abstraction.
//!
//! Every repository operation runs inside one [`StoreTx`], so a permission
//! check and the write it guards observe the same transactional state.

mod memory;
mod sea;

pub use memory::MemoryStore;
pub use sea::SeaOrmStore;

use async_trait::async_trait;
use modkit_security::AclValue;

use crate::error::StoreError;
use crate::expr::AccessExpr;
use crate::query::{SelectQuery, Visibility};
use crate::record::Record;

#[async_trait]
pub trait AclStore: Send + Sync {
    type Tx: StoreTx;

    /// Open a transaction.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the host cannot start a transaction.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One host transaction.
///
/// Updates are buffered until the next read with [`Visibility::Pending`],
/// the next delete, or commit. Inserts and deletes apply immediately.
///
/// Every method fails with [`StoreError`] when the host storage fails or the
/// entity type has no backing table.
#[async_trait]
pub trait StoreTx: Send {
    /// Rows of `query.entity_type` matching `query.condition`.
    ///
    /// # Errors
    /// See the trait documentation.
    async fn select(
        &mut self,
        query: &SelectQuery,
        visibility: Visibility,
    ) -> Result<Vec<Record>, StoreError>;

    /// Number of distinct rows matching `condition`.
    ///
    /// # Errors
    /// See the trait documentation.
    async fn count(&mut self, entity_type: &str, condition: &AccessExpr)
    -> Result<u64, StoreError>;

    /// Insert a new row and return it with its assigned identifier.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when the identifier is already taken.
    async fn insert(&mut self, record: Record) -> Result<Record, StoreError>;

    /// Queue an update of an existing row. Fields absent from `record` keep
    /// their stored value.
    ///
    /// # Errors
    /// Returns [`StoreError::MissingRow`] when the row does not exist.
    async fn update(&mut self, record: Record) -> Result<Record, StoreError>;

    /// Delete rows by identifier, or every row of the type when `ids` is `None`.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    /// See the trait documentation.
    async fn delete(
        &mut self,
        entity_type: &str,
        ids: Option<&[AclValue]>,
    ) -> Result<u64, StoreError>;

    /// Write back pending changes and commit.
    ///
    /// # Errors
    /// See the trait documentation.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard the transaction.
    ///
    /// # Errors
    /// See the trait documentation.
    async fn rollback(self) -> Result<(), StoreError>;
}
