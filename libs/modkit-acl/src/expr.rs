//! The compiled access predicate.
//!
//! An [`AccessExpr`] is built purely by the compiler and translated to a
//! concrete query form only at the end (see [`crate::query`]). Smart
//! constructors fold constants so that trivially true or false predicates stay
//! recognisable, which lets executors short-circuit them.

use std::fmt;

use modkit_security::AclValue;

use crate::metadata::{JoinSpec, Link};
use crate::record::Record;

/// Caller-supplied column predicate on the root entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq { column: String, value: AclValue },
    In { column: String, values: Vec<AclValue> },
    All(Vec<Filter>),
    Any(Vec<Filter>),
}

impl Filter {
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<AclValue>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn is_in<V: Into<AclValue>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate against a single record.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Eq { column, value } => record.get(column).is_some_and(|v| value.matches_json(v)),
            Self::In { column, values } => record
                .get(column)
                .is_some_and(|v| values.iter().any(|x| x.matches_json(v))),
            Self::All(items) => items.iter().all(|f| f.matches(record)),
            Self::Any(items) => items.iter().any(|f| f.matches(record)),
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq { column, value } => write!(f, "{column} = {value}"),
            Self::In { column, values } => write!(f, "{column} IN ({})", join_display(values, ", ")),
            Self::All(items) => write!(f, "({})", join_display(items, " AND ")),
            Self::Any(items) => write!(f, "({})", join_display(items, " OR ")),
        }
    }
}

/// Matching of a grant record's permission column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionMatch {
    pub column: String,
    /// Stored permission names that satisfy the requested kind.
    pub accepted: Vec<String>,
}

impl PermissionMatch {
    pub(crate) fn values(&self) -> Vec<AclValue> {
        self.accepted
            .iter()
            .map(|s| AclValue::from(s.as_str()))
            .collect()
    }
}

/// Boolean predicate over rows of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessExpr {
    Const(bool),
    /// The row's own identifier equals the principal id.
    Identity { column: String, value: AclValue },
    /// The row's owner (through `link`) is the principal.
    OwnerEq { link: Link, value: AclValue },
    /// A grant record linked through `link` names the principal.
    GrantLinkEq {
        link: Link,
        owner_column: String,
        value: AclValue,
        permission: Option<PermissionMatch>,
    },
    /// A row linked through `link` satisfies `expr`.
    ParentDelegate { link: Link, expr: Box<AccessExpr> },
    Filter(Filter),
    Or(Vec<AccessExpr>),
    And(Vec<AccessExpr>),
}

impl AccessExpr {
    #[must_use]
    pub const fn allow_all() -> Self {
        Self::Const(true)
    }

    #[must_use]
    pub const fn deny_all() -> Self {
        Self::Const(false)
    }

    #[must_use]
    pub fn is_allow_all(&self) -> bool {
        matches!(self, Self::Const(true))
    }

    #[must_use]
    pub fn is_deny_all(&self) -> bool {
        matches!(self, Self::Const(false))
    }

    /// Disjunction. Empty is false; any true branch makes the whole true.
    #[must_use]
    pub fn or(branches: impl IntoIterator<Item = Self>) -> Self {
        let mut out = Vec::new();
        for branch in branches {
            match branch {
                Self::Const(true) => return Self::Const(true),
                Self::Const(false) => {}
                Self::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match <[Self; 1]>::try_from(out) {
            Ok([only]) => only,
            Err(out) if out.is_empty() => Self::Const(false),
            Err(out) => Self::Or(out),
        }
    }

    /// Conjunction. Empty is true; any false part makes the whole false.
    #[must_use]
    pub fn and(parts: impl IntoIterator<Item = Self>) -> Self {
        let mut out = Vec::new();
        for part in parts {
            match part {
                Self::Const(false) => return Self::Const(false),
                Self::Const(true) => {}
                Self::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match <[Self; 1]>::try_from(out) {
            Ok([only]) => only,
            Err(out) if out.is_empty() => Self::Const(true),
            Err(out) => Self::And(out),
        }
    }

    /// Delegate to rows reachable through `link`. A false inner predicate can
    /// never be satisfied, so the delegation folds to false.
    #[must_use]
    pub fn delegate(link: Link, expr: Self) -> Self {
        if expr.is_deny_all() {
            return Self::Const(false);
        }
        Self::ParentDelegate {
            link,
            expr: Box::new(expr),
        }
    }

    /// Top-level OR branches (a non-OR expression is its own single branch).
    #[must_use]
    pub fn branches(&self) -> &[Self] {
        match self {
            Self::Or(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    /// Entity types traversed by each chain of parent delegations.
    #[must_use]
    pub fn delegation_paths(&self) -> Vec<Vec<String>> {
        let mut paths = Vec::new();
        self.collect_paths(&mut Vec::new(), &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        match self {
            Self::ParentDelegate { link, expr } => {
                prefix.push(link.target.clone());
                out.push(prefix.clone());
                expr.collect_paths(prefix, out);
                prefix.pop();
            }
            Self::Or(items) | Self::And(items) => {
                for item in items {
                    item.collect_paths(prefix, out);
                }
            }
            Self::Const(_)
            | Self::Identity { .. }
            | Self::OwnerEq { .. }
            | Self::GrantLinkEq { .. }
            | Self::Filter(_) => {}
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            Self::Const(true) => writeln!(f, "{pad}TRUE"),
            Self::Const(false) => writeln!(f, "{pad}FALSE"),
            Self::Identity { column, value } => writeln!(f, "{pad}self: {column} = {value}"),
            Self::OwnerEq { link, value } => {
                writeln!(f, "{pad}owner {}: {} = {value}", link.attribute, link_column(link))
            }
            Self::GrantLinkEq {
                link,
                owner_column,
                value,
                permission,
            } => {
                write!(
                    f,
                    "{pad}grant {} -> {}: {owner_column} = {value}",
                    link.attribute, link.target
                )?;
                if let Some(p) = permission {
                    write!(f, " AND {} IN ({})", p.column, p.accepted.join(", "))?;
                }
                writeln!(f)
            }
            Self::ParentDelegate { link, expr } => {
                writeln!(f, "{pad}parent {} -> {}:", link.attribute, link.target)?;
                expr.fmt_indented(f, depth + 1)
            }
            Self::Filter(filter) => writeln!(f, "{pad}filter: {filter}"),
            Self::Or(items) | Self::And(items) => {
                writeln!(f, "{pad}{}", if matches!(self, Self::Or(_)) { "OR" } else { "AND" })?;
                for item in items {
                    item.fmt_indented(f, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

fn link_column(link: &Link) -> String {
    match &link.join {
        JoinSpec::Local(col) => col.clone(),
        JoinSpec::Remote(_) => format!("{}.{}", link.target, link.target_id),
    }
}

impl fmt::Display for AccessExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl From<Filter> for AccessExpr {
    fn from(f: Filter) -> Self {
        Self::Filter(f)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn link(target: &str) -> Link {
        Link {
            attribute: target.to_owned(),
            source_id: "id".to_owned(),
            target: target.to_owned(),
            target_table: format!("{target}s"),
            target_id: "id".to_owned(),
            join: JoinSpec::Local(format!("{target}_id")),
        }
    }

    fn owner(v: i64) -> AccessExpr {
        AccessExpr::OwnerEq {
            link: link("user"),
            value: AclValue::Int(v),
        }
    }

    #[test]
    fn or_folds_constants() {
        assert!(AccessExpr::or(Vec::new()).is_deny_all());
        assert!(AccessExpr::or([AccessExpr::deny_all(), AccessExpr::deny_all()]).is_deny_all());
        assert!(AccessExpr::or([owner(1), AccessExpr::allow_all()]).is_allow_all());
        assert_eq!(AccessExpr::or([AccessExpr::deny_all(), owner(1)]), owner(1));
        assert_eq!(
            AccessExpr::or([owner(1), AccessExpr::or([owner(2), owner(3)])]).branches().len(),
            3
        );
    }

    #[test]
    fn and_folds_constants() {
        assert!(AccessExpr::and(Vec::new()).is_allow_all());
        assert!(AccessExpr::and([owner(1), AccessExpr::deny_all()]).is_deny_all());
        assert_eq!(AccessExpr::and([AccessExpr::allow_all(), owner(1)]), owner(1));
    }

    #[test]
    fn delegate_to_false_is_false() {
        assert!(AccessExpr::delegate(link("project"), AccessExpr::deny_all()).is_deny_all());
        assert!(matches!(
            AccessExpr::delegate(link("project"), AccessExpr::allow_all()),
            AccessExpr::ParentDelegate { .. }
        ));
    }

    #[test]
    fn delegation_paths_follow_nesting() {
        let expr = AccessExpr::or([
            owner(1),
            AccessExpr::delegate(
                link("project"),
                AccessExpr::or([owner(1), AccessExpr::delegate(link("team"), owner(1))]),
            ),
        ]);
        assert_eq!(
            expr.delegation_paths(),
            vec![
                vec!["project".to_owned()],
                vec!["project".to_owned(), "team".to_owned()]
            ]
        );
    }

    #[test]
    fn filter_matches_record() {
        let record = Record::new("order").with("status", "open").with("total", 10);
        assert!(Filter::eq("status", "open").matches(&record));
        assert!(Filter::is_in("total", [5_i64, 10]).matches(&record));
        assert!(!Filter::All(vec![Filter::eq("status", "open"), Filter::eq("total", 11)]).matches(&record));
        assert!(Filter::Any(vec![Filter::eq("status", "x"), Filter::eq("total", 10)]).matches(&record));
        assert!(!Filter::eq("missing", 1).matches(&record));
    }

    #[test]
    fn display_renders_tree() {
        let text = AccessExpr::or([owner(7), AccessExpr::delegate(link("project"), owner(7))]).to_string();
        assert!(text.starts_with("OR\n"));
        assert!(text.contains("owner user: user_id = 7"));
        assert!(text.contains("parent project -> project:"));

        let filter = Filter::All(vec![Filter::eq("status", "open"), Filter::is_in("id", [1_i64, 2])]);
        assert_eq!(filter.to_string(), "(status = open AND id IN (1, 2))");
    }
}
