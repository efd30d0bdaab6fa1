use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use modkit_security::AclValue;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{AclStore, StoreTx};
use crate::error::StoreError;
use crate::expr::AccessExpr;
use crate::metadata::{EntityMeta, JoinSpec, Link, MetadataRegistry};
use crate::query::{SelectQuery, SortOrder, Visibility};
use crate::record::Record;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<String, BTreeMap<AclValue, Record>>,
    next_id: i64,
}

impl Tables {
    fn table(&self, entity_type: &str) -> impl Iterator<Item = &Record> {
        self.rows.get(entity_type).into_iter().flat_map(BTreeMap::values)
    }

    /// Rows reachable from `row` through `link`.
    fn linked<'a>(&'a self, link: &Link, row: &Record) -> Vec<&'a Record> {
        match &link.join {
            JoinSpec::Local(fk) => row
                .value_of(fk)
                .and_then(|id| self.rows.get(&link.target)?.get(&id))
                .into_iter()
                .collect(),
            JoinSpec::Remote(fk) => {
                let Some(id) = row.value_of(&link.source_id) else {
                    return Vec::new();
                };
                self.table(&link.target)
                    .filter(|t| t.get(fk).is_some_and(|v| id.matches_json(v)))
                    .collect()
            }
        }
    }

    fn eval(&self, expr: &AccessExpr, row: &Record) -> bool {
        let field_eq =
            |r: &Record, column: &str, value: &AclValue| r.get(column).is_some_and(|v| value.matches_json(v));

        match expr {
            AccessExpr::Const(b) => *b,
            AccessExpr::Identity { column, value } => field_eq(row, column, value),
            AccessExpr::OwnerEq { link, value } => match &link.join {
                JoinSpec::Local(fk) => field_eq(row, fk, value),
                JoinSpec::Remote(_) => self
                    .linked(link, row)
                    .into_iter()
                    .any(|t| field_eq(t, &link.target_id, value)),
            },
            AccessExpr::GrantLinkEq {
                link,
                owner_column,
                value,
                permission,
            } => self.linked(link, row).into_iter().any(|grant| {
                field_eq(grant, owner_column, value)
                    && permission.as_ref().is_none_or(|p| {
                        grant
                            .get(&p.column)
                            .is_some_and(|v| p.values().iter().any(|a| a.matches_json(v)))
                    })
            }),
            AccessExpr::ParentDelegate { link, expr } => self
                .linked(link, row)
                .into_iter()
                .any(|parent| self.eval(expr, parent)),
            AccessExpr::Filter(filter) => filter.matches(row),
            AccessExpr::Or(items) => items.iter().any(|e| self.eval(e, row)),
            AccessExpr::And(items) => items.iter().all(|e| self.eval(e, row)),
        }
    }
}

fn cmp_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or_default()
                .total_cmp(&y.as_f64().unwrap_or_default()),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn cmp_records(a: &Record, b: &Record, order: &[SortOrder]) -> Ordering {
    for o in order {
        let ord = cmp_json(a.get(&o.column), b.get(&o.column));
        let ord = if o.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// In-process store for tests and embedded use.
///
/// Transactions are serialized: `begin` holds an async mutex until the
/// transaction commits or is dropped, so every transaction observes a
/// consistent snapshot and no check can be invalidated mid-transaction.
/// Rows without an identifier get the next auto-increment integer.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    registry: Arc<MetadataRegistry>,
    state: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(Tables::default())),
        }
    }

    /// Insert `records` in one committed transaction, bypassing access control.
    ///
    /// # Errors
    /// Propagates insert failures (unknown entity types, duplicate ids).
    pub async fn seed(&self, records: impl IntoIterator<Item = Record>) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        for record in records {
            tx.insert(record).await?;
        }
        tx.commit().await
    }

    /// Committed rows of `entity_type`, in identifier order.
    #[must_use]
    pub async fn snapshot(&self, entity_type: &str) -> Vec<Record> {
        self.state.lock().await.table(entity_type).cloned().collect()
    }
}

#[async_trait]
impl AclStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTx {
            guard,
            working,
            pending: BTreeMap::new(),
            registry: Arc::clone(&self.registry),
        })
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    pending: BTreeMap<(String, AclValue), Record>,
    registry: Arc<MetadataRegistry>,
}

impl MemoryTx {
    fn meta(&self, entity_type: &str) -> Result<Arc<EntityMeta>, StoreError> {
        self.registry
            .get(entity_type)
            .cloned()
            .ok_or_else(|| StoreError::UnknownEntity(entity_type.to_owned()))
    }

    fn flush(&mut self) {
        for ((entity_type, id), changes) in std::mem::take(&mut self.pending) {
            if let Some(row) = self
                .working
                .rows
                .get_mut(&entity_type)
                .and_then(|t| t.get_mut(&id))
            {
                row.merge_from(&changes);
            }
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn select(
        &mut self,
        query: &SelectQuery,
        visibility: Visibility,
    ) -> Result<Vec<Record>, StoreError> {
        self.meta(&query.entity_type)?;
        if visibility == Visibility::Pending {
            self.flush();
        }

        let mut rows: Vec<Record> = self
            .working
            .table(&query.entity_type)
            .filter(|r| self.working.eval(&query.condition, r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| cmp_records(a, b, &query.order));

        if let Some(page) = query.page {
            let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
            let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
            rows = rows.into_iter().skip(offset).take(limit).collect();
        }
        Ok(rows)
    }

    async fn count(&mut self, entity_type: &str, condition: &AccessExpr) -> Result<u64, StoreError> {
        self.meta(entity_type)?;
        self.flush();
        let n = self
            .working
            .table(entity_type)
            .filter(|r| self.working.eval(condition, r))
            .count();
        Ok(u64::try_from(n).unwrap_or(u64::MAX))
    }

    async fn insert(&mut self, mut record: Record) -> Result<Record, StoreError> {
        let meta = self.meta(record.entity_type())?;
        let id = if let Some(id) = record.value_of(&meta.id_column) {
            if let AclValue::Int(n) = id {
                self.working.next_id = self.working.next_id.max(n);
            }
            id
        } else {
            self.working.next_id = self
                .working
                .next_id
                .checked_add(1)
                .ok_or_else(|| StoreError::IdsExhausted(meta.name.clone()))?;
            let id = AclValue::Int(self.working.next_id);
            record.set(meta.id_column.clone(), id.to_json());
            id
        };

        let table = self.working.rows.entry(meta.name.clone()).or_default();
        if table.contains_key(&id) {
            return Err(StoreError::Conflict {
                entity: meta.name.clone(),
                id: id.to_string(),
            });
        }
        table.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&mut self, record: Record) -> Result<Record, StoreError> {
        let meta = self.meta(record.entity_type())?;
        let Some(id) = record.value_of(&meta.id_column) else {
            return Err(StoreError::Internal(format!(
                "update of '{}' without identifier",
                meta.name
            )));
        };
        let Some(stored) = self.working.rows.get(&meta.name).and_then(|t| t.get(&id)) else {
            return Err(StoreError::MissingRow {
                entity: meta.name.clone(),
                id: id.to_string(),
            });
        };

        let mut merged = stored.clone();
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
        self.meta(entity_type)?;
        self.flush();
        let Some(table) = self.working.rows.get_mut(entity_type) else {
            return Ok(0);
        };
        let removed = match ids {
            Some(ids) => ids.iter().filter(|id| table.remove(*id).is_some()).count(),
            None => std::mem::take(table).len(),
        };
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.flush();
        *self.guard = std::mem::take(&mut self.working);
        tracing::trace!("memory transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        tracing::trace!("memory transaction rolled back");
        Ok(())
    }
}
