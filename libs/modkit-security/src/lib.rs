#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
pub mod permission;
pub mod principal;
pub mod resolver;
pub mod value;

pub use permission::{PermissionKind, UnknownPermission};
pub use principal::{Principal, PrincipalBuilder};
pub use resolver::{
    PrincipalResolver, StaticPrincipalResolver, TaskLocalPrincipalResolver, with_principal,
};
pub use value::AclValue;

/// Role that marks a principal as unrestricted unless configured otherwise.
pub const ROLE_ADMIN: &str = "ROLE_ADMIN";
