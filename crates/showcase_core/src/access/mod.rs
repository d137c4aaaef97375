//! Access Gate seam for mutating catalog operations.
//!
//! # Responsibility
//! - Define how a bearer credential resolves to a principal with a role.
//! - Decide whether a principal may create, update or delete projects.
//!
//! # Invariants
//! - Authorization happens before any store or file access.
//! - Read operations never consult the gate.
//!
//! The production gate (an external directory service client) lives outside
//! this crate; `StaticAccessGate` covers tests and local tooling.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Directory-service role category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Faculty,
    Intern,
    Other(String),
}

impl Role {
    /// Maps a directory-service category string to a role.
    pub fn from_category(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "docente" | "faculty" => Self::Faculty,
            "estagiario" | "intern" => Self::Intern,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only the two privileged roles may mutate the catalog.
    pub fn can_mutate(&self) -> bool {
        matches!(self, Self::Faculty | Self::Intern)
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingCredential,
    /// Credential unknown, malformed or expired.
    InvalidCredential,
    Forbidden { subject: String },
    /// The directory service could not be reached.
    Unavailable(String),
}

impl AuthError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingCredential | Self::InvalidCredential => 401,
            Self::Forbidden { .. } => 403,
            Self::Unavailable(_) => 500,
        }
    }
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredential => write!(f, "not authenticated"),
            Self::InvalidCredential => write!(f, "credential is invalid or expired"),
            Self::Forbidden { subject } => write!(f, "principal `{subject}` is not authorized"),
            Self::Unavailable(message) => {
                write!(f, "authentication service unavailable: {message}")
            }
        }
    }
}

impl Error for AuthError {}

/// Resolves bearer credentials to principals.
pub trait AccessGate: Send + Sync {
    fn resolve(&self, credential: &str) -> Result<Principal, AuthError>;
}

/// Authorizes one mutating request.
pub fn authorize_mutation(
    gate: &dyn AccessGate,
    credential: Option<&str>,
) -> Result<Principal, AuthError> {
    let credential = credential
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MissingCredential)?;
    let principal = gate.resolve(credential)?;
    if !principal.role.can_mutate() {
        return Err(AuthError::Forbidden {
            subject: principal.subject,
        });
    }
    Ok(principal)
}

/// In-process token table.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessGate {
    principals: HashMap<String, Principal>,
}

impl StaticAccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        subject: impl Into<String>,
        role: Role,
    ) -> Self {
        self.principals.insert(
            token.into(),
            Principal {
                subject: subject.into(),
                role,
            },
        );
        self
    }
}

impl AccessGate for StaticAccessGate {
    fn resolve(&self, credential: &str) -> Result<Principal, AuthError> {
        self.principals
            .get(credential)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}

#[cfg(test)]
mod tests {
    use super::{authorize_mutation, AuthError, Role, StaticAccessGate};

    fn gate() -> StaticAccessGate {
        StaticAccessGate::new()
            .with_token("t-faculty", "prof", Role::Faculty)
            .with_token("t-student", "student", Role::from_category("aluno"))
    }

    #[test]
    fn privileged_role_is_authorized() {
        let principal = authorize_mutation(&gate(), Some("t-faculty")).unwrap();
        assert_eq!(principal.role, Role::Faculty);
    }

    #[test]
    fn missing_and_unknown_credentials_are_unauthenticated() {
        assert_eq!(
            authorize_mutation(&gate(), None),
            Err(AuthError::MissingCredential)
        );
        assert_eq!(
            authorize_mutation(&gate(), Some("  ")),
            Err(AuthError::MissingCredential)
        );
        let err = authorize_mutation(&gate(), Some("nope")).unwrap_err();
        assert_eq!(err, AuthError::InvalidCredential);
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn other_roles_are_forbidden() {
        let err = authorize_mutation(&gate(), Some("t-student")).unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn categories_map_to_privileged_roles() {
        assert!(Role::from_category("Docente").can_mutate());
        assert!(Role::from_category("estagiario").can_mutate());
        assert!(!Role::from_category("discente").can_mutate());
    }
}
