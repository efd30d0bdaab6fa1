//! Storage-facing query model and the translation of [`AccessExpr`] through
//! a [`QueryBuilder`] capability.

use modkit_security::AclValue;

use crate::expr::{AccessExpr, Filter};
use crate::metadata::{JoinSpec, Link};

/// Primitive operations a storage layer must offer to run compiled predicates.
///
/// `Source` identifies a row set inside the query under construction (the
/// root entity or a joined relation); `Expr` is the dialect's boolean type.
pub trait QueryBuilder {
    type Source: Clone;
    type Expr;

    /// Join `link` from `from`, returning the joined row set.
    fn join(&mut self, from: &Self::Source, link: &Link) -> Self::Source;
    fn equal(&mut self, at: &Self::Source, column: &str, value: &AclValue) -> Self::Expr;
    fn is_in(&mut self, at: &Self::Source, column: &str, values: &[AclValue]) -> Self::Expr;
    /// A joined row is present (the join found a match).
    fn exists(&mut self, joined: &Self::Source, link: &Link) -> Self::Expr;
    fn constant(&mut self, value: bool) -> Self::Expr;
    fn or(&mut self, exprs: Vec<Self::Expr>) -> Self::Expr;
    fn and(&mut self, exprs: Vec<Self::Expr>) -> Self::Expr;
    fn order_by(&mut self, at: &Self::Source, column: &str, ascending: bool);
}

/// Translate `expr`, rooted at `at`, into the builder's native form.
pub fn translate<B: QueryBuilder>(expr: &AccessExpr, builder: &mut B, at: &B::Source) -> B::Expr {
    match expr {
        AccessExpr::Const(value) => builder.constant(*value),
        AccessExpr::Identity { column, value } => builder.equal(at, column, value),
        AccessExpr::OwnerEq { link, value } => match &link.join {
            // The FK column already holds the owner's identifier.
            JoinSpec::Local(column) => builder.equal(at, column, value),
            JoinSpec::Remote(_) => {
                let joined = builder.join(at, link);
                builder.equal(&joined, &link.target_id, value)
            }
        },
        AccessExpr::GrantLinkEq {
            link,
            owner_column,
            value,
            permission,
        } => {
            let joined = builder.join(at, link);
            let mut parts = vec![builder.equal(&joined, owner_column, value)];
            if let Some(permission) = permission {
                parts.push(builder.is_in(&joined, &permission.column, &permission.values()));
            }
            builder.and(parts)
        }
        AccessExpr::ParentDelegate { link, expr } => {
            let joined = builder.join(at, link);
            let present = builder.exists(&joined, link);
            let inner = translate(expr, builder, &joined);
            builder.and(vec![present, inner])
        }
        AccessExpr::Filter(filter) => translate_filter(filter, builder, at),
        AccessExpr::Or(items) => {
            let exprs = items.iter().map(|e| translate(e, builder, at)).collect();
            builder.or(exprs)
        }
        AccessExpr::And(items) => {
            let exprs = items.iter().map(|e| translate(e, builder, at)).collect();
            builder.and(exprs)
        }
    }
}

fn translate_filter<B: QueryBuilder>(filter: &Filter, builder: &mut B, at: &B::Source) -> B::Expr {
    match filter {
        Filter::Eq { column, value } => builder.equal(at, column, value),
        Filter::In { column, values } => builder.is_in(at, column, values),
        Filter::All(items) => {
            let exprs = items.iter().map(|f| translate_filter(f, builder, at)).collect();
            builder.and(exprs)
        }
        Filter::Any(items) => {
            let exprs = items.iter().map(|f| translate_filter(f, builder, at)).collect();
            builder.or(exprs)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub column: String,
    pub ascending: bool,
}

impl SortOrder {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
}

impl PageRequest {
    #[must_use]
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    #[must_use]
    pub fn first(limit: u64) -> Self {
        Self::new(0, limit)
    }
}

/// Whether a read inside a transaction sees the transaction's own pending
/// (not yet written back) changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Write back pending changes, then read.
    #[default]
    Pending,
    /// Read without writing back pending changes; they stay invisible.
    Committed,
}

/// A collection query over one entity type.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub entity_type: String,
    pub condition: AccessExpr,
    pub order: Vec<SortOrder>,
    pub page: Option<PageRequest>,
    /// Hold a write lock on the selected root rows until the transaction ends.
    pub lock: bool,
}

impl SelectQuery {
    #[must_use]
    pub fn new(entity_type: impl Into<String>, condition: AccessExpr) -> Self {
        Self {
            entity_type: entity_type.into(),
            condition,
            order: Vec::new(),
            page: None,
            lock: false,
        }
    }

    #[must_use]
    pub fn order_by(mut self, order: Vec<SortOrder>) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn page(mut self, page: Option<PageRequest>) -> Self {
        self.page = page;
        self
    }

    /// Lock the matched root rows against concurrent writers, so a decision
    /// taken on them holds until the transaction ends.
    #[must_use]
    pub fn for_update(mut self) -> Self {
        self.lock = true;
        self
    }
}
