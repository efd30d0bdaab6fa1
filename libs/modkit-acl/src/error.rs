use std::path::PathBuf;

use modkit_security::PermissionKind;
use thiserror::Error;

/// A single problem found while validating ACL metadata.
///
/// Validation collects every problem instead of stopping at the first one, so
/// each variant names the entity type (and attribute, where relevant) at fault.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to load ACL configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),

    #[error("principal type '{0}' is not a declared entity type")]
    UnknownPrincipalType(String),

    #[error("entity '{entity}': id column '{column}' is not among the declared columns")]
    MissingIdColumn { entity: String, column: String },

    #[error("entity '{entity}': relation '{attribute}' is declared more than once")]
    DuplicateRelation { entity: String, attribute: String },

    #[error("entity '{entity}': ACL attribute '{attribute}' is not a declared relation")]
    UnknownRelation { entity: String, attribute: String },

    #[error("entity '{entity}': relation '{attribute}' targets unknown entity type '{target}'")]
    UnknownTarget {
        entity: String,
        attribute: String,
        target: String,
    },

    #[error("entity '{entity}': column '{column}' referenced by '{attribute}' does not exist")]
    UnknownColumn {
        entity: String,
        attribute: String,
        column: String,
    },

    #[error(
        "entity '{entity}': grant link '{attribute}' targets '{target}', which declares no grant schema"
    )]
    MissingGrantSchema {
        entity: String,
        attribute: String,
        target: String,
    },

    #[error("entity '{entity}': rule '{attribute}' grants no permission kinds")]
    EmptyPermissions { entity: String, attribute: String },
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures raised by the host storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),

    #[error("row '{id}' of '{entity}' already exists")]
    Conflict { entity: String, id: String },

    #[error("row '{id}' of '{entity}' does not exist")]
    MissingRow { entity: String, id: String },

    #[error("store has no table for entity type '{0}'")]
    UnknownEntity(String),

    #[error("no identifiers left for '{0}'")]
    IdsExhausted(String),

    #[error("{0}")]
    Internal(String),
}

/// Errors surfaced by the permission-aware repository.
///
/// `NotFound` is returned both for rows that do not exist and for rows the
/// principal may not access; callers cannot tell the two apart.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("{kind} access to '{entity}' denied")]
    Denied {
        entity: String,
        kind: PermissionKind,
    },

    #[error("'{entity}' with id '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("invalid ACL configuration: {}", join_errors(.0))]
    Configuration(Vec<ConfigError>),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl AclError {
    pub(crate) fn denied(entity: &str, kind: PermissionKind) -> Self {
        Self::Denied {
            entity: entity.to_owned(),
            kind,
        }
    }

    pub(crate) fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_owned(),
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

impl From<ConfigError> for AclError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(vec![e])
    }
}

impl From<sea_orm::DbErr> for AclError {
    fn from(e: sea_orm::DbErr) -> Self {
        Self::Storage(StoreError::Db(e))
    }
}
