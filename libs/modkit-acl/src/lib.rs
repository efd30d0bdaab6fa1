#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Row-level access control for `ModKit` entities.
//!
//! Entity types declare, in configuration, which relations make a principal an
//! owner, which grant records give it access, and which parent rows it may
//! inherit access from. The [`PredicateCompiler`] turns those declarations into
//! an [`AccessExpr`] for one principal, entity type and permission kind, and the
//! [`AclRepository`] applies it to every find, save and delete.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use modkit_acl::{AclRepository, MemoryStore, MetadataRegistry};
//! use modkit_security::{PermissionKind, Principal, StaticPrincipalResolver};
//!
//! let registry = Arc::new(MetadataRegistry::from_yaml_str(CONFIG)?);
//! let store = Arc::new(MemoryStore::new(registry.clone()));
//! let resolver = Arc::new(StaticPrincipalResolver::for_principal(Principal::new(1)));
//!
//! let orders = AclRepository::new(registry, "order", store, resolver)?;
//! let order = orders.get_one(5, PermissionKind::Read).await?;
//! ```
//!
//! Absent and inaccessible rows are reported the same way, as
//! [`AclError::NotFound`].

mod check;
pub mod compiler;
pub mod error;
pub mod expr;
pub mod gateway;
pub mod metadata;
pub mod query;
pub mod record;
pub mod repository;
pub mod sql;
pub mod store;

pub use compiler::PredicateCompiler;
pub use error::{AclError, ConfigError, StoreError};
pub use expr::{AccessExpr, Filter, PermissionMatch};
pub use gateway::SubResourceGateway;
pub use metadata::{AclConfig, EntityMeta, MetadataRegistry};
pub use query::{PageRequest, QueryBuilder, SelectQuery, SortOrder, Visibility, translate};
pub use record::Record;
pub use repository::{AclRepository, AclSession, FindOptions};
pub use sql::SqlQueryBuilder;
pub use store::{AclStore, MemoryStore, SeaOrmStore, StoreTx};
