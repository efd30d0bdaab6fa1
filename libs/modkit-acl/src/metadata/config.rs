use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use modkit_security::{PermissionKind, ROLE_ADMIN};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable prefix for configuration overrides.
///
/// `ACL__PRINCIPAL_TYPE=member` overrides `principal_type`; nested keys are
/// separated by `__`.
pub const ENV_PREFIX: &str = "ACL__";

fn default_admin_roles() -> Vec<String> {
    vec![ROLE_ADMIN.to_owned()]
}

fn default_id_column() -> String {
    "id".to_owned()
}

/// Root of the ACL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AclConfig {
    /// Entity type whose rows represent principals (enables the "self" rule).
    #[serde(default)]
    pub principal_type: Option<String>,

    /// Roles that make a principal unrestricted.
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,

    #[serde(default)]
    pub entities: BTreeMap<String, EntityConfig>,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            principal_type: None,
            admin_roles: default_admin_roles(),
            entities: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityConfig {
    pub table: String,

    #[serde(default = "default_id_column")]
    pub id_column: String,

    pub columns: Vec<String>,

    #[serde(default)]
    pub relations: Vec<RelationConfig>,

    /// Access rules. Absent means the type is ungoverned (visible to everyone).
    #[serde(default)]
    pub acl: Option<AclRulesConfig>,

    /// Present on entity types that store explicit grant records.
    #[serde(default)]
    pub grant: Option<GrantSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationConfig {
    pub attribute: String,
    pub target: String,
    pub join: JoinSpec,
}

/// Which side of a relation holds the foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSpec {
    /// This entity holds the FK column pointing at the target's id.
    Local(String),
    /// The target holds the FK column pointing back at this entity's id.
    Remote(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AclRulesConfig {
    pub owners: Vec<RuleRef>,
    pub parents: Vec<RuleRef>,
    pub grant_links: Vec<RuleRef>,
}

/// Rule entry: a bare attribute name (grants every kind) or an attribute with
/// the permission kinds it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleRef {
    Attribute(String),
    Scoped {
        attribute: String,
        permissions: Vec<PermissionKind>,
    },
}

impl RuleRef {
    #[must_use]
    pub fn attribute(&self) -> &str {
        match self {
            Self::Attribute(a) | Self::Scoped { attribute: a, .. } => a,
        }
    }

    #[must_use]
    pub fn permissions(&self) -> Vec<PermissionKind> {
        match self {
            Self::Attribute(_) => vec![PermissionKind::All],
            Self::Scoped { permissions, .. } => permissions.clone(),
        }
    }
}

/// Column layout of an explicit grant record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantSchema {
    /// Column holding the grantee's principal id.
    pub owner_column: String,
    /// Optional column holding the granted permission name.
    #[serde(default)]
    pub permission_column: Option<String>,
}

impl AclConfig {
    /// Parse a configuration from a YAML string.
    ///
    /// # Errors
    /// Returns [`ConfigError::Load`] when the document does not match the schema.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Figment::from(Yaml::string(yaml))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Load a configuration file, applying `ACL__` environment overrides.
    ///
    /// # Errors
    /// Returns [`ConfigError::FileNotFound`] when `path` does not exist and
    /// [`ConfigError::Load`] when the merged document does not match the schema.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }
}
