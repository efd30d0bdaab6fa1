use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use modkit_security::AclValue;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, FromQueryResult,
    IsolationLevel, JsonValue, Statement, StatementBuilder, TransactionTrait,
};

use super::{AclStore, StoreTx};
use crate::error::StoreError;
use crate::expr::{AccessExpr, Filter};
use crate::metadata::{EntityMeta, MetadataRegistry};
use crate::query::{PageRequest, SelectQuery, Visibility};
use crate::record::Record;
use crate::sql;

/// Store backed by a `SeaORM` connection.
///
/// Each [`SeaOrmTx`] wraps a real database transaction. Rows are exchanged as
/// JSON objects keyed by column name, so no entity models are required.
///
/// Update checks lock the checked row with `SELECT ... FOR UPDATE`. Rows the
/// decision was derived from (grant records, parents) are not locked; use
/// [`SeaOrmStore::with_isolation_level`] with
/// [`IsolationLevel::Serializable`] when concurrent changes to those must
/// abort the transaction instead.
#[derive(Debug, Clone)]
pub struct SeaOrmStore {
    conn: DatabaseConnection,
    registry: Arc<MetadataRegistry>,
    isolation: Option<IsolationLevel>,
}

impl SeaOrmStore {
    #[must_use]
    pub fn new(conn: DatabaseConnection, registry: Arc<MetadataRegistry>) -> Self {
        Self {
            conn,
            registry,
            isolation: None,
        }
    }

    /// Begin every transaction at `level` instead of the server default.
    /// `SQLite` ignores it with a warning.
    #[must_use]
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }
}

#[async_trait]
impl AclStore for SeaOrmStore {
    type Tx = SeaOrmTx;

    async fn begin(&self) -> Result<SeaOrmTx, StoreError> {
        let tx = match self.isolation {
            Some(level) => self.conn.begin_with_config(Some(level), None).await?,
            None => self.conn.begin().await?,
        };
        Ok(SeaOrmTx {
            tx,
            registry: Arc::clone(&self.registry),
            pending: BTreeMap::new(),
        })
    }
}

#[derive(FromQueryResult)]
struct CountRow {
    count: i64,
}

pub struct SeaOrmTx {
    tx: DatabaseTransaction,
    registry: Arc<MetadataRegistry>,
    pending: BTreeMap<(String, AclValue), Record>,
}

impl SeaOrmTx {
    fn meta(&self, entity_type: &str) -> Result<Arc<EntityMeta>, StoreError> {
        self.registry
            .get(entity_type)
            .cloned()
            .ok_or_else(|| StoreError::UnknownEntity(entity_type.to_owned()))
    }

    fn build<S: StatementBuilder>(&self, stmt: &S) -> Statement {
        self.tx.get_database_backend().build(stmt)
    }

    async fn fetch(&self, entity_type: &str, stmt: Statement) -> Result<Vec<Record>, StoreError> {
        JsonValue::find_by_statement(stmt)
            .all(&self.tx)
            .await?
            .into_iter()
            .map(|row| to_record(entity_type, row))
            .collect()
    }

    async fn find_by_id(&self, meta: &EntityMeta, id: &AclValue) -> Result<Option<Record>, StoreError> {
        let query = SelectQuery::new(
            meta.name.clone(),
            Filter::eq(meta.id_column.clone(), id.clone()).into(),
        )
        .page(Some(PageRequest::first(1)));
        let stmt = self.build(&sql::select_statement(meta, &query));
        Ok(self.fetch(&meta.name, stmt).await?.into_iter().next())
    }

    /// Write queued updates back to the database.
    async fn flush(&mut self) -> Result<(), StoreError> {
        for ((entity_type, id), changes) in std::mem::take(&mut self.pending) {
            let meta = self.meta(&entity_type)?;
            let Some(stmt) = sql::update_statement(&meta, &id, &changes) else {
                continue;
            };
            let result = self.tx.execute(self.build(&stmt)).await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::MissingRow {
                    entity: entity_type,
                    id: id.to_string(),
                });
            }
            tracing::trace!(entity = %meta.name, %id, "flushed pending update");
        }
        Ok(())
    }
}

fn to_record(entity_type: &str, row: JsonValue) -> Result<Record, StoreError> {
    match row {
        JsonValue::Object(fields) => Ok(Record::from_fields(entity_type, fields)),
        other => Err(StoreError::Internal(format!(
            "expected a row object for '{entity_type}', got {other}"
        ))),
    }
}

#[async_trait]
impl StoreTx for SeaOrmTx {
    async fn select(
        &mut self,
        query: &SelectQuery,
        visibility: Visibility,
    ) -> Result<Vec<Record>, StoreError> {
        let meta = self.meta(&query.entity_type)?;
        if visibility == Visibility::Pending {
            self.flush().await?;
        }
        let stmt = self.build(&sql::select_statement(&meta, query));
        self.fetch(&meta.name, stmt).await
    }

    async fn count(&mut self, entity_type: &str, condition: &AccessExpr) -> Result<u64, StoreError> {
        let meta = self.meta(entity_type)?;
        self.flush().await?;
        let stmt = self.build(&sql::count_statement(&meta, condition));
        let row = CountRow::find_by_statement(stmt).one(&self.tx).await?;
        let count = row
            .map(|r| r.count)
            .ok_or_else(|| StoreError::Internal(format!("count of '{entity_type}' returned no row")))?;
        u64::try_from(count).map_err(|e| StoreError::Internal(e.to_string()))
    }

    async fn insert(&mut self, record: Record) -> Result<Record, StoreError> {
        let meta = self.meta(record.entity_type())?;
        let mut stmt = sql::insert_statement(&meta, &record)?;
        let backend = self.tx.get_database_backend();

        if backend == DbBackend::Postgres {
            stmt.returning_all();
            let row = JsonValue::find_by_statement(backend.build(&stmt))
                .one(&self.tx)
                .await?
                .ok_or_else(|| StoreError::Internal(format!("insert into '{}' returned no row", meta.table)))?;
            return to_record(&meta.name, row);
        }

        // No RETURNING here: the row is read back by identifier instead.
        let result = self.tx.execute(backend.build(&stmt)).await?;
        let id = match record.value_of(&meta.id_column) {
            Some(id) => id,
            None => i64::try_from(result.last_insert_id())
                .map(AclValue::Int)
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        };
        self.find_by_id(&meta, &id).await?.ok_or_else(|| StoreError::MissingRow {
            entity: meta.name.clone(),
            id: id.to_string(),
        })
    }

    async fn update(&mut self, record: Record) -> Result<Record, StoreError> {
        let meta = self.meta(record.entity_type())?;
        let Some(id) = record.value_of(&meta.id_column) else {
            return Err(StoreError::Internal(format!(
                "update of '{}' without identifier",
                meta.name
            )));
        };

        let Some(mut merged) = self.find_by_id(&meta, &id).await? else {
            return Err(StoreError::MissingRow {
                entity: meta.name.clone(),
                id: id.to_string(),
            });
        };

        let queued = self
            .pending
            .entry((meta.name.clone(), id))
            .and_modify(|p| p.merge_from(&record))
            .or_insert(record);
        merged.merge_from(queued);
        Ok(merged)
    }

    async fn delete(
        &mut self,
        entity_type: &str,
        ids: Option<&[AclValue]>,
    ) -> Result<u64, StoreError> {
        let meta = self.meta(entity_type)?;
        self.flush().await?;
        if ids.is_some_and(<[AclValue]>::is_empty) {
            return Ok(0);
        }
        let stmt = self.build(&sql::delete_statement(&meta, ids));
        Ok(self.tx.execute(stmt).await?.rows_affected())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.flush().await?;
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
