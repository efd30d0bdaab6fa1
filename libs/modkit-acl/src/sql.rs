//! SQL rendering of compiled predicates on top of `sea-query`.
//!
//! The root entity is always aliased `t0`; every join introduced while
//! translating gets the next alias (`t1`, `t2`, ...) in translation order, so
//! the same expression always renders the same SQL. Joins are LEFT joins and
//! collection queries select `DISTINCT t0.*`, which keeps a row that matches
//! several OR branches from appearing more than once.

use modkit_security::AclValue;
use sea_orm::sea_query::{
    Alias, Asterisk, Condition, DeleteStatement, Expr, Func, InsertStatement, JoinType, LockType,
    Order, Query, SelectStatement, SimpleExpr, UpdateStatement,
};
use uuid::Uuid;

use crate::error::StoreError;
use crate::expr::AccessExpr;
use crate::metadata::{EntityMeta, JoinSpec, Link};
use crate::query::{QueryBuilder, SelectQuery, translate};
use crate::record::Record;

pub const ROOT_ALIAS: &str = "t0";

/// Alias of the `COUNT(DISTINCT ...)` column in count queries.
pub const COUNT_ALIAS: &str = "count";

struct JoinClause {
    table: String,
    alias: String,
    on: SimpleExpr,
}

/// [`QueryBuilder`] producing `sea-query` conditions and joins.
#[derive(Default)]
pub struct SqlQueryBuilder {
    joins: Vec<JoinClause>,
    order: Vec<(String, String, bool)>,
}

impl SqlQueryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(self, stmt: &mut SelectStatement, condition: Condition) {
        for join in self.joins {
            stmt.join_as(
                JoinType::LeftJoin,
                Alias::new(join.table),
                Alias::new(join.alias),
                join.on,
            );
        }
        stmt.cond_where(condition);
        for (alias, column, ascending) in self.order {
            let order = if ascending { Order::Asc } else { Order::Desc };
            stmt.order_by((Alias::new(alias), Alias::new(column)), order);
        }
    }
}

fn col(alias: &str, column: &str) -> Expr {
    Expr::col((Alias::new(alias), Alias::new(column)))
}

impl QueryBuilder for SqlQueryBuilder {
    type Source = String;
    type Expr = Condition;

    fn join(&mut self, from: &String, link: &Link) -> String {
        let alias = format!("t{}", self.joins.len() + 1);
        let on = match &link.join {
            JoinSpec::Local(fk) => {
                col(&alias, &link.target_id).equals((Alias::new(from), Alias::new(fk)))
            }
            JoinSpec::Remote(fk) => {
                col(&alias, fk).equals((Alias::new(from), Alias::new(&link.source_id)))
            }
        };
        self.joins.push(JoinClause {
            table: link.target_table.clone(),
            alias: alias.clone(),
            on,
        });
        alias
    }

    fn equal(&mut self, at: &String, column: &str, value: &AclValue) -> Condition {
        Condition::all().add(col(at, column).eq(acl_value_to_sea(value)))
    }

    fn is_in(&mut self, at: &String, column: &str, values: &[AclValue]) -> Condition {
        if values.is_empty() {
            return self.constant(false);
        }
        Condition::all().add(col(at, column).is_in(values.iter().map(acl_value_to_sea)))
    }

    fn exists(&mut self, joined: &String, link: &Link) -> Condition {
        Condition::all().add(col(joined, &link.target_id).is_not_null())
    }

    fn constant(&mut self, value: bool) -> Condition {
        Condition::all().add(Expr::value(value))
    }

    fn or(&mut self, exprs: Vec<Condition>) -> Condition {
        if exprs.is_empty() {
            return self.constant(false);
        }
        exprs.into_iter().fold(Condition::any(), Condition::add)
    }

    fn and(&mut self, exprs: Vec<Condition>) -> Condition {
        if exprs.is_empty() {
            return self.constant(true);
        }
        exprs.into_iter().fold(Condition::all(), Condition::add)
    }

    fn order_by(&mut self, at: &String, column: &str, ascending: bool) {
        self.order.push((at.clone(), column.to_owned(), ascending));
    }
}

/// `SELECT DISTINCT t0.* FROM <table> t0 ... WHERE <condition> ORDER BY ... LIMIT/OFFSET`.
#[must_use]
pub fn select_statement(meta: &EntityMeta, query: &SelectQuery) -> SelectStatement {
    let mut builder = SqlQueryBuilder::new();
    let root = ROOT_ALIAS.to_owned();
    let condition = translate(&query.condition, &mut builder, &root);
    for order in &query.order {
        builder.order_by(&root, &order.column, order.ascending);
    }

    let mut stmt = Query::select();
    stmt.column((Alias::new(ROOT_ALIAS), Asterisk))
        .from_as(Alias::new(&meta.table), Alias::new(ROOT_ALIAS));
    // Postgres rejects FOR UPDATE together with DISTINCT and on the nullable
    // side of an outer join, so a locking read locks `t0` only and keeps
    // duplicates.
    if query.lock {
        stmt.lock_with_tables(LockType::Update, [Alias::new(ROOT_ALIAS)]);
    } else {
        stmt.distinct();
    }
    builder.apply(&mut stmt, condition);
    if let Some(page) = query.page {
        stmt.limit(page.limit).offset(page.offset);
    }
    stmt
}

/// `SELECT COUNT(DISTINCT t0.<id>) AS count FROM <table> t0 ... WHERE <condition>`.
#[must_use]
pub fn count_statement(meta: &EntityMeta, condition: &AccessExpr) -> SelectStatement {
    let mut builder = SqlQueryBuilder::new();
    let root = ROOT_ALIAS.to_owned();
    let condition = translate(condition, &mut builder, &root);

    let mut stmt = Query::select();
    stmt.expr_as(
        Func::count_distinct(col(ROOT_ALIAS, &meta.id_column)),
        Alias::new(COUNT_ALIAS),
    )
    .from_as(Alias::new(&meta.table), Alias::new(ROOT_ALIAS));
    builder.apply(&mut stmt, condition);
    stmt
}

fn declared_fields<'a>(
    meta: &'a EntityMeta,
    record: &'a Record,
) -> impl Iterator<Item = (&'a String, SimpleExpr)> + 'a {
    meta.columns.iter().filter_map(|c| {
        record
            .fields()
            .get(c)
            .map(|v| (c, SimpleExpr::from(json_to_sea_value(v))))
    })
}

/// `INSERT` of the declared columns present in `record`.
///
/// # Errors
/// Returns [`StoreError::Internal`] when the statement cannot be assembled.
pub fn insert_statement(meta: &EntityMeta, record: &Record) -> Result<InsertStatement, StoreError> {
    let (columns, values): (Vec<_>, Vec<_>) = declared_fields(meta, record).unzip();

    let mut stmt = Query::insert();
    stmt.into_table(Alias::new(&meta.table));
    if columns.is_empty() {
        stmt.or_default_values();
    } else {
        stmt.columns(columns.into_iter().map(Alias::new))
            .values(values)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
    }
    Ok(stmt)
}

/// `UPDATE ... SET <fields> WHERE <id> = ...`; `None` when there is nothing to set.
#[must_use]
pub fn update_statement(meta: &EntityMeta, id: &AclValue, record: &Record) -> Option<UpdateStatement> {
    let values: Vec<_> = declared_fields(meta, record)
        .filter(|(c, _)| **c != meta.id_column)
        .map(|(c, v)| (Alias::new(c), v))
        .collect();
    if values.is_empty() {
        return None;
    }

    let mut stmt = Query::update();
    stmt.table(Alias::new(&meta.table))
        .values(values)
        .and_where(Expr::col(Alias::new(&meta.id_column)).eq(acl_value_to_sea(id)));
    Some(stmt)
}

/// `DELETE FROM <table>` restricted to `ids`, or every row when `ids` is `None`.
#[must_use]
pub fn delete_statement(meta: &EntityMeta, ids: Option<&[AclValue]>) -> DeleteStatement {
    let mut stmt = Query::delete();
    stmt.from_table(Alias::new(&meta.table));
    if let Some(ids) = ids {
        stmt.and_where(Expr::col(Alias::new(&meta.id_column)).is_in(ids.iter().map(acl_value_to_sea)));
    }
    stmt
}

/// Convert an [`AclValue`] for SQL binding.
#[must_use]
pub fn acl_value_to_sea(v: &AclValue) -> sea_orm::Value {
    match v {
        AclValue::Uuid(u) => sea_orm::Value::from(*u),
        AclValue::String(s) => sea_orm::Value::from(s.clone()),
        AclValue::Int(n) => sea_orm::Value::from(*n),
        AclValue::Bool(b) => sea_orm::Value::from(*b),
    }
}

/// Convert a stored JSON field for SQL binding. Strings holding a UUID bind
/// as UUIDs so they compare equal to native UUID columns.
#[must_use]
pub fn json_to_sea_value(v: &serde_json::Value) -> sea_orm::Value {
    match v {
        serde_json::Value::Null => sea_orm::Value::String(None),
        serde_json::Value::Bool(b) => sea_orm::Value::from(*b),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => sea_orm::Value::from(i),
            (None, Some(f)) => sea_orm::Value::from(f),
            (None, None) => sea_orm::Value::from(n.to_string()),
        },
        serde_json::Value::String(s) => Uuid::parse_str(s)
            .map_or_else(|_| sea_orm::Value::from(s.clone()), sea_orm::Value::from),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => sea_orm::Value::from(v.clone()),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compiler::PredicateCompiler;
    use crate::expr::Filter;
    use crate::metadata::MetadataRegistry;
    use crate::query::{PageRequest, SortOrder};
    use modkit_security::{PermissionKind, Principal};
    use sea_orm::sea_query::{PostgresQueryBuilder, SqliteQueryBuilder};

    const CONFIG: &str = r"
entities:
  user: { table: users, columns: [id] }
  project:
    table: projects
    columns: [id, owner_id]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
    acl: { owners: [owner] }
  order:
    table: orders
    columns: [id, owner_id, project_id, total]
    relations:
      - { attribute: owner, target: user, join: { local: owner_id } }
      - { attribute: project, target: project, join: { local: project_id } }
      - { attribute: grants, target: order_grant, join: { remote: order_id } }
    acl: { owners: [owner], parents: [project], grant_links: [grants] }
  order_grant:
    table: order_grants
    columns: [id, order_id, owner_id]
    grant: { owner_column: owner_id }
";

    fn setup() -> (Arc<MetadataRegistry>, PredicateCompiler) {
        let registry = Arc::new(MetadataRegistry::from_yaml_str(CONFIG).unwrap());
        (registry.clone(), PredicateCompiler::new(registry))
    }

    #[test]
    fn select_uses_distinct_root_and_deterministic_aliases() {
        let (registry, compiler) = setup();
        let meta = registry.get("order").unwrap();
        let expr = compiler.compile(Some(&Principal::new(1_i64)), "order", PermissionKind::Read);
        let query = SelectQuery::new("order", expr)
            .order_by(vec![SortOrder::asc("id")])
            .page(Some(PageRequest::new(10, 5)));

        let sql = select_statement(meta, &query).to_string(PostgresQueryBuilder);
        assert!(sql.starts_with(r#"SELECT DISTINCT "t0".* FROM "orders" AS "t0""#), "{sql}");
        assert!(sql.contains(r#"LEFT JOIN "order_grants" AS "t1" ON "t1"."order_id" = "t0"."id""#), "{sql}");
        assert!(sql.contains(r#"LEFT JOIN "projects" AS "t2" ON "t2"."id" = "t0"."project_id""#), "{sql}");
        assert!(sql.contains(r#""t0"."owner_id" = 1"#), "{sql}");
        assert!(sql.contains(r#""t1"."owner_id" = 1"#), "{sql}");
        assert!(sql.contains(r#""t2"."id" IS NOT NULL"#), "{sql}");
        assert!(sql.contains(r#""t2"."owner_id" = 1"#), "{sql}");
        assert!(sql.ends_with(r#"ORDER BY "t0"."id" ASC LIMIT 5 OFFSET 10"#), "{sql}");

        let again = select_statement(meta, &query).to_string(PostgresQueryBuilder);
        assert_eq!(sql, again);
    }

    #[test]
    fn locking_select_holds_root_row() {
        let (registry, compiler) = setup();
        let meta = registry.get("order").unwrap();
        let expr = compiler.compile(Some(&Principal::new(1_i64)), "order", PermissionKind::Update);
        let by_id = AccessExpr::and([expr, Filter::eq("id", 7_i64).into()]);
        let query = SelectQuery::new("order", by_id)
            .page(Some(PageRequest::first(1)))
            .for_update();

        let sql = select_statement(meta, &query).to_string(PostgresQueryBuilder);
        assert!(sql.starts_with(r#"SELECT "t0".* FROM "orders" AS "t0""#), "{sql}");
        assert!(sql.ends_with(r#"LIMIT 1 OFFSET 0 FOR UPDATE OF "t0""#), "{sql}");

        let sqlite = select_statement(meta, &query).to_string(SqliteQueryBuilder);
        assert!(!sqlite.contains("FOR UPDATE"), "{sqlite}");
    }

    #[test]
    fn deny_all_renders_false() {
        let (registry, compiler) = setup();
        let meta = registry.get("order").unwrap();
        let query = SelectQuery::new("order", compiler.compile(None, "order", PermissionKind::Read));
        let sql = select_statement(meta, &query).to_string(PostgresQueryBuilder);
        assert!(sql.contains("WHERE FALSE"), "{sql}");
        assert!(!sql.contains("JOIN"), "{sql}");
    }

    #[test]
    fn count_counts_distinct_ids() {
        let (registry, _) = setup();
        let meta = registry.get("order").unwrap();
        let sql = count_statement(meta, &AccessExpr::Filter(Filter::eq("total", 3_i64)))
            .to_string(PostgresQueryBuilder);
        assert!(sql.starts_with(r#"SELECT COUNT(DISTINCT "t0"."id") AS "count" FROM "orders" AS "t0""#), "{sql}");
        assert!(sql.contains(r#""t0"."total" = 3"#), "{sql}");
    }

    #[test]
    fn write_statements_use_declared_columns() {
        let (registry, _) = setup();
        let meta = registry.get("order").unwrap();
        let record = Record::new("order").with("owner_id", 1).with("total", 9).with("note", "x");

        let insert = insert_statement(meta, &record).unwrap().to_string(PostgresQueryBuilder);
        assert_eq!(
            insert,
            r#"INSERT INTO "orders" ("owner_id", "total") VALUES (1, 9)"#
        );

        let update = update_statement(meta, &AclValue::Int(5), &record.clone().with("id", 5))
            .unwrap()
            .to_string(PostgresQueryBuilder);
        assert_eq!(
            update,
            r#"UPDATE "orders" SET "owner_id" = 1, "total" = 9 WHERE "id" = 5"#
        );
        assert!(update_statement(meta, &AclValue::Int(5), &Record::new("order").with("id", 5)).is_none());

        let delete = delete_statement(meta, Some(&[AclValue::Int(1), AclValue::Int(2)]))
            .to_string(PostgresQueryBuilder);
        assert_eq!(delete, r#"DELETE FROM "orders" WHERE "id" IN (1, 2)"#);
    }
}
