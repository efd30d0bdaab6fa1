//! Entity metadata: the configuration schema, its validation, and the
//! immutable registry the compiler and repositories read from.

mod config;
mod registry;

pub use config::{
    AclConfig, AclRulesConfig, ENV_PREFIX, EntityConfig, GrantSchema, JoinSpec, RelationConfig,
    RuleRef,
};
pub use registry::{AccessRules, EntityMeta, Link, MetadataRegistry, RelationDef, Rule, validate};
