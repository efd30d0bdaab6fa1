use serde::{Deserialize, Serialize};

use crate::AclValue;

/// `Principal` is the authenticated actor attempting an operation.
///
/// Resolved once per operation and immutable for its duration. Absence of a
/// principal (an unauthenticated caller) is modelled as `Option::None` by the
/// callers, never as a sentinel principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Opaque identifier compared against owner / grant columns.
    subject_id: AclValue,
    #[serde(default)]
    roles: Vec<String>,
    /// Administrative privilege: bypasses row-level filtering entirely.
    #[serde(default)]
    unrestricted: bool,
}

impl Principal {
    /// Create a new `Principal` builder for the given subject.
    #[must_use]
    pub fn builder(subject_id: impl Into<AclValue>) -> PrincipalBuilder {
        PrincipalBuilder {
            subject_id: subject_id.into(),
            roles: Vec::new(),
            unrestricted: false,
        }
    }

    /// A plain principal with no roles.
    #[must_use]
    pub fn new(subject_id: impl Into<AclValue>) -> Self {
        Self::builder(subject_id).build()
    }

    #[must_use]
    pub fn subject_id(&self) -> &AclValue {
        &self.subject_id
    }

    #[must_use]
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }

    /// Return a copy carrying the resolver's unrestricted verdict.
    #[must_use]
    pub fn with_unrestricted(mut self, unrestricted: bool) -> Self {
        self.unrestricted = unrestricted;
        self
    }
}

pub struct PrincipalBuilder {
    subject_id: AclValue,
    roles: Vec<String>,
    unrestricted: bool,
}

impl PrincipalBuilder {
    #[must_use]
    pub fn role(mut self, role: &str) -> Self {
        self.roles.push(role.to_owned());
        self
    }

    #[must_use]
    pub fn roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    #[must_use]
    pub fn unrestricted(mut self, unrestricted: bool) -> Self {
        self.unrestricted = unrestricted;
        self
    }

    #[must_use]
    pub fn build(self) -> Principal {
        Principal {
            subject_id: self.subject_id,
            roles: self.roles,
            unrestricted: self.unrestricted,
        }
    }
}
