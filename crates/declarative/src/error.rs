//! Error types for reconciliation.
//!
//! Errors fall into three groups that decide how far a run gets:
//! - declaration errors (schema, references, cycles) abort before planning
//! - state errors (lock, corruption) abort before any mutation
//! - provider errors are per resource and live in [`crate::provider`]

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A problem with one attribute of one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Address of the declaration, e.g. `subnet.s1`
    pub address: String,
    /// Attribute path, e.g. `address_prefixes[0]`
    pub attribute: String,
    /// What is wrong with it
    pub reason: String,
}

impl FieldError {
    pub fn new(
        address: impl Into<String>,
        attribute: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.address, self.attribute, self.reason)
    }
}

/// A reference whose target is not part of the declaration set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedRef {
    /// Address of the declaration holding the reference
    pub from: String,
    /// Attribute path holding the reference
    pub attribute: String,
    /// Logical name that could not be found
    pub target: String,
}

impl fmt::Display for UnresolvedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> '{}'", self.from, self.attribute, self.target)
    }
}

fn join_lines<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("\n  - {i}"))
        .collect::<String>()
}

/// Errors that can occur while validating, planning or applying.
#[derive(Debug, Error)]
pub enum Error {
    /// A declaration uses a kind the registry does not know
    #[error("unknown resource kind '{kind}' (declared by '{name}')")]
    UnknownKind {
        /// The unrecognized kind
        kind: String,
        /// Logical name of the offending declaration
        name: String,
    },

    /// One or more attributes failed schema validation
    #[error("invalid declarations:{}", join_lines(.0))]
    Validation(Vec<FieldError>),

    /// Two declarations share a logical name
    #[error("duplicate declaration of '{name}' ({first} and {second})")]
    DuplicateDeclaration {
        /// The logical name declared twice
        name: String,
        /// Where the first declaration came from
        first: String,
        /// Where the second declaration came from
        second: String,
    },

    /// References to logical names that are not declared
    #[error("unresolved references:{}", join_lines(.0))]
    UnresolvedReference(Vec<UnresolvedRef>),

    /// References that point at a declaration of the wrong kind, or at an
    /// attribute the target does not have
    #[error("invalid references:{}", join_lines(.0))]
    InvalidReference(Vec<FieldError>),

    /// Declarations reference each other in a loop
    #[error("cyclic dependency between: {}", .participants.join(", "))]
    CyclicDependency {
        /// Every logical name taking part in a cycle
        participants: Vec<String>,
    },

    /// Another run holds the state lock
    #[error("state at {} is locked by {holder}", .path.display())]
    StateLocked {
        /// Path of the lock file
        path: PathBuf,
        /// Description of the lock holder
        holder: String,
    },

    /// The state file cannot be trusted
    #[error("state file {} is corrupt: {reason}", .path.display())]
    StateCorrupt {
        /// Path of the state file
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// The plan still has drifted entries without a resolution
    #[error("drift must be resolved (recreate or forget) before apply: {}", .names.join(", "))]
    UnresolvedDrift {
        /// Logical names of drifted resources
        names: Vec<String>,
    },

    /// The apply worker pool could not be started
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error comes from the declarations themselves.
    ///
    /// These are raised before any state is read or provider called.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownKind { .. }
                | Self::Validation(_)
                | Self::DuplicateDeclaration { .. }
                | Self::UnresolvedReference(_)
                | Self::InvalidReference(_)
                | Self::CyclicDependency { .. }
        )
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
