use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of access requested for an operation.
///
/// `Create` is evaluated against the candidate entity itself (there is no row
/// to filter yet); every other kind is compiled into a query filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Read,
    Create,
    Update,
    Delete,
    /// Matches every kind when granted; when requested, only an `All` grant satisfies it.
    All,
}

impl PermissionKind {
    pub const ALL_KINDS: [Self; 5] = [Self::Read, Self::Create, Self::Update, Self::Delete, Self::All];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::All => "all",
        }
    }

    /// Whether a rule granting `self` covers a request for `requested`.
    #[must_use]
    pub fn grants(self, requested: Self) -> bool {
        self == Self::All || self == requested
    }

    /// Whether any of `granted` covers a request for `self`.
    #[must_use]
    pub fn is_granted_by(self, granted: &[Self]) -> bool {
        granted.iter().any(|g| g.grants(self))
    }

    /// Stored permission names that satisfy a request for `self`.
    ///
    /// Used when matching the permission column of explicit grant records.
    #[must_use]
    pub fn satisfying_names(self) -> Vec<&'static str> {
        if self == Self::All {
            vec![Self::All.as_str()]
        } else {
            vec![self.as_str(), Self::All.as_str()]
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown permission kind: '{0}'")]
pub struct UnknownPermission(pub String);

impl FromStr for PermissionKind {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL_KINDS
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPermission(s.to_owned()))
    }
}
