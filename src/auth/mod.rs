//! Authentication and authorization module
//!
//! Reviewers authenticate with a bearer JWT; the role claim decides what
//! they may change.

mod jwt;
mod middleware;

pub use jwt::{decode_token, Claims};
pub use middleware::{auth_middleware, require_role};

use serde::{Deserialize, Serialize};

/// Reviewer roles for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only access to the mirror, changes and ontology
    #[default]
    Viewer,
    /// Can refresh datasources and edit the ontology
    Developer,
    /// Can also resolve pending changes
    Admin,
}

impl Role {
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Developer | Role::Admin)
    }

    pub fn can_resolve(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "viewer"),
            Role::Developer => write!(f, "developer"),
            Role::Admin => write!(f, "admin"),
        }
    }
}
