use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use modkit_security::PermissionKind;

use super::config::{AclConfig, AclRulesConfig, EntityConfig, GrantSchema, JoinSpec, RuleRef};
use crate::error::{AclError, ConfigError};

/// A relation attribute of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub attribute: String,
    pub target: String,
    pub join: JoinSpec,
}

/// One access rule: the relation it follows and the kinds it grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub attribute: String,
    pub permissions: Vec<PermissionKind>,
}

impl Rule {
    #[must_use]
    pub fn applies_to(&self, kind: PermissionKind) -> bool {
        kind.is_granted_by(&self.permissions)
    }
}

/// Access rules of an ACL-governed entity type, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRules {
    pub owners: Vec<Rule>,
    pub parents: Vec<Rule>,
    pub grant_links: Vec<Rule>,
}

/// Validated metadata of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    pub name: String,
    pub table: String,
    pub id_column: String,
    pub columns: Vec<String>,
    pub relations: Vec<RelationDef>,
    pub rules: Option<AccessRules>,
    pub grant: Option<GrantSchema>,
}

impl EntityMeta {
    #[must_use]
    pub fn relation(&self, attribute: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.attribute == attribute)
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Whether the type carries access rules. Ungoverned types are visible to
    /// every principal.
    #[must_use]
    pub fn is_governed(&self) -> bool {
        self.rules.is_some()
    }
}

/// Everything needed to follow one relation from a source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub attribute: String,
    /// Identifier column of the source entity.
    pub source_id: String,
    pub target: String,
    pub target_table: String,
    /// Identifier column of the target entity.
    pub target_id: String,
    pub join: JoinSpec,
}

/// Immutable, validated view of the ACL configuration.
///
/// Built once at startup and shared behind an `Arc`; all accessors are
/// read-only, so concurrent use needs no synchronization.
#[derive(Debug, Clone)]
pub struct MetadataRegistry {
    principal_type: Option<String>,
    admin_roles: Vec<String>,
    entities: BTreeMap<String, Arc<EntityMeta>>,
}

impl MetadataRegistry {
    /// Validate `config` and build the registry.
    ///
    /// # Errors
    /// Returns [`AclError::Configuration`] listing every problem found.
    pub fn from_config(config: AclConfig) -> Result<Self, AclError> {
        let errors = validate(&config);
        if !errors.is_empty() {
            return Err(AclError::Configuration(errors));
        }

        let entities = config
            .entities
            .into_iter()
            .map(|(name, entity)| {
                let meta = build_meta(name.clone(), entity);
                (name, Arc::new(meta))
            })
            .collect();

        tracing::debug!(
            principal_type = config.principal_type.as_deref().unwrap_or("-"),
            "ACL metadata registry built"
        );

        Ok(Self {
            principal_type: config.principal_type,
            admin_roles: config.admin_roles,
            entities,
        })
    }

    /// Parse YAML and build the registry.
    ///
    /// # Errors
    /// Returns [`AclError::Configuration`] on parse or validation failure.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AclError> {
        Self::from_config(AclConfig::from_yaml_str(yaml)?)
    }

    #[must_use]
    pub fn principal_type(&self) -> Option<&str> {
        self.principal_type.as_deref()
    }

    #[must_use]
    pub fn admin_roles(&self) -> &[String] {
        &self.admin_roles
    }

    #[must_use]
    pub fn get(&self, entity_type: &str) -> Option<&Arc<EntityMeta>> {
        self.entities.get(entity_type)
    }

    /// Like [`get`](Self::get) but reports unknown types as configuration errors.
    ///
    /// # Errors
    /// Returns [`AclError::Configuration`] when the type is not declared.
    pub fn entity(&self, entity_type: &str) -> Result<&Arc<EntityMeta>, AclError> {
        self.get(entity_type)
            .ok_or_else(|| ConfigError::UnknownEntity(entity_type.to_owned()).into())
    }

    /// Access rules for `entity_type`, absent for ungoverned or unknown types.
    #[must_use]
    pub fn descriptor_for(&self, entity_type: &str) -> Option<&AccessRules> {
        self.get(entity_type).and_then(|m| m.rules.as_ref())
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Resolve `attribute` of `source` into a followable link.
    #[must_use]
    pub fn link(&self, source: &EntityMeta, attribute: &str) -> Option<Link> {
        let relation = source.relation(attribute)?;
        let target = self.get(&relation.target)?;
        Some(Link {
            attribute: relation.attribute.clone(),
            source_id: source.id_column.clone(),
            target: target.name.clone(),
            target_table: target.table.clone(),
            target_id: target.id_column.clone(),
            join: relation.join.clone(),
        })
    }
}

fn build_meta(name: String, entity: EntityConfig) -> EntityMeta {
    let rules = entity.acl.map(|acl| AccessRules {
        owners: to_rules(&acl.owners),
        parents: to_rules(&acl.parents),
        grant_links: to_rules(&acl.grant_links),
    });
    EntityMeta {
        name,
        table: entity.table,
        id_column: entity.id_column,
        columns: entity.columns,
        relations: entity
            .relations
            .into_iter()
            .map(|r| RelationDef {
                attribute: r.attribute,
                target: r.target,
                join: r.join,
            })
            .collect(),
        rules,
        grant: entity.grant,
    }
}

fn to_rules(refs: &[RuleRef]) -> Vec<Rule> {
    refs.iter()
        .map(|r| Rule {
            attribute: r.attribute().to_owned(),
            permissions: r.permissions(),
        })
        .collect()
}

/// Check `config` and return every problem found.
#[must_use]
pub fn validate(config: &AclConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    if let Some(pt) = &config.principal_type
        && !config.entities.contains_key(pt)
    {
        errors.push(ConfigError::UnknownPrincipalType(pt.clone()));
    }

    for (name, entity) in &config.entities {
        validate_entity(config, name, entity, &mut errors);
    }

    errors
}

fn validate_entity(
    config: &AclConfig,
    name: &str,
    entity: &EntityConfig,
    errors: &mut Vec<ConfigError>,
) {
    let has_column = |e: &EntityConfig, c: &str| e.columns.iter().any(|col| col == c);

    if !has_column(entity, &entity.id_column) {
        errors.push(ConfigError::MissingIdColumn {
            entity: name.to_owned(),
            column: entity.id_column.clone(),
        });
    }

    let mut seen = BTreeSet::new();
    for relation in &entity.relations {
        if !seen.insert(relation.attribute.as_str()) {
            errors.push(ConfigError::DuplicateRelation {
                entity: name.to_owned(),
                attribute: relation.attribute.clone(),
            });
        }

        let Some(target) = config.entities.get(&relation.target) else {
            errors.push(ConfigError::UnknownTarget {
                entity: name.to_owned(),
                attribute: relation.attribute.clone(),
                target: relation.target.clone(),
            });
            continue;
        };

        let (owner_name, owner, column) = match &relation.join {
            JoinSpec::Local(col) => (name, entity, col),
            JoinSpec::Remote(col) => (relation.target.as_str(), target, col),
        };
        if !has_column(owner, column) {
            errors.push(ConfigError::UnknownColumn {
                entity: owner_name.to_owned(),
                attribute: relation.attribute.clone(),
                column: column.clone(),
            });
        }
    }

    if let Some(grant) = &entity.grant {
        let grant_columns =
            std::iter::once(&grant.owner_column).chain(grant.permission_column.as_ref());
        for column in grant_columns {
            if !has_column(entity, column) {
                errors.push(ConfigError::UnknownColumn {
                    entity: name.to_owned(),
                    attribute: "grant".to_owned(),
                    column: column.clone(),
                });
            }
        }
    }

    if let Some(acl) = &entity.acl {
        validate_rules(config, name, entity, acl, errors);
    }
}

fn validate_rules(
    config: &AclConfig,
    name: &str,
    entity: &EntityConfig,
    acl: &AclRulesConfig,
    errors: &mut Vec<ConfigError>,
) {
    let all_rules = acl
        .owners
        .iter()
        .chain(&acl.parents)
        .chain(&acl.grant_links);

    for rule in all_rules {
        let attribute = rule.attribute();
        if !entity.relations.iter().any(|r| r.attribute == attribute) {
            errors.push(ConfigError::UnknownRelation {
                entity: name.to_owned(),
                attribute: attribute.to_owned(),
            });
        }
        if rule.permissions().is_empty() {
            errors.push(ConfigError::EmptyPermissions {
                entity: name.to_owned(),
                attribute: attribute.to_owned(),
            });
        }
    }

    for rule in &acl.grant_links {
        let Some(relation) = entity
            .relations
            .iter()
            .find(|r| r.attribute == rule.attribute())
        else {
            continue;
        };
        let has_schema = config
            .entities
            .get(&relation.target)
            .is_some_and(|t| t.grant.is_some());
        if config.entities.contains_key(&relation.target) && !has_schema {
            errors.push(ConfigError::MissingGrantSchema {
                entity: name.to_owned(),
                attribute: relation.attribute.clone(),
                target: relation.target.clone(),
            });
        }
    }
}
