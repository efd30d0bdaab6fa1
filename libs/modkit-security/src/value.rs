use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A comparable scalar used for principal identifiers and filter values.
///
/// Stored rows carry JSON values; [`AclValue::matches_json`] is the single place
/// where the two representations are compared, so the in-memory evaluator and
/// the SQL translation agree on what "equal" means.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AclValue {
    Bool(bool),
    Int(i64),
    /// UUID value. Deserialization tries UUID before plain strings.
    Uuid(Uuid),
    String(String),
}

impl AclValue {
    /// Try to extract a UUID from this value.
    ///
    /// Returns `Some` for `AclValue::Uuid` directly, and for
    /// `AclValue::String` if the string is a valid UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            Self::String(s) => Uuid::parse_str(s).ok(),
            Self::Int(_) | Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Bool(_) | Self::Uuid(_) | Self::String(_) => None,
        }
    }

    /// Convert a stored JSON scalar into an `AclValue`.
    ///
    /// Strings are tried as UUIDs first for consistent matching. Floats,
    /// arrays, objects and `null` have no `AclValue` counterpart.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) => Some(
                Uuid::parse_str(s).map_or_else(|_| Self::String(s.clone()), Self::Uuid),
            ),
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(n) => serde_json::Value::from(*n),
            Self::Uuid(u) => serde_json::Value::String(u.to_string()),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Equality against a stored JSON value.
    ///
    /// A UUID matches a JSON string holding the same UUID in any casing.
    #[must_use]
    pub fn matches_json(&self, value: &serde_json::Value) -> bool {
        match (self, value) {
            (Self::Bool(a), serde_json::Value::Bool(b)) => a == b,
            (Self::Int(a), serde_json::Value::Number(n)) => n.as_i64() == Some(*a),
            (Self::Uuid(a), serde_json::Value::String(s)) => {
                Uuid::parse_str(s).is_ok_and(|u| u == *a)
            }
            (Self::String(a), serde_json::Value::String(s)) => {
                a == s || Uuid::parse_str(a).is_ok_and(|u| Uuid::parse_str(s) == Ok(u))
            }
            _ => false,
        }
    }
}

impl fmt::Display for AclValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<Uuid> for AclValue {
    #[inline]
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}

impl From<&Uuid> for AclValue {
    #[inline]
    fn from(u: &Uuid) -> Self {
        Self::Uuid(*u)
    }
}

impl From<String> for AclValue {
    #[inline]
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for AclValue {
    #[inline]
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<i64> for AclValue {
    #[inline]
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for AclValue {
    #[inline]
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<bool> for AclValue {
    #[inline]
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
