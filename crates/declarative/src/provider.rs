//! Provider client boundary
//!
//! A provider performs the actual create/read/update/delete calls against an
//! infrastructure API. Errors are categorized so the applier can decide
//! whether to retry.

use crate::types::{Address, Attributes};
use thiserror::Error;

/// Categories of provider errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The object does not exist remotely
    NotFound,
    /// Throttling, timeouts and other conditions worth retrying
    Transient,
    /// The request was refused and will be refused again
    Rejected,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::NotFound => "Resource not found",
            Self::Transient => "Transient provider error",
            Self::Rejected => "Request rejected by provider",
        }
    }
}

/// Errors returned by a [`Provider`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The object behind an identity is gone
    #[error("not found: {identity}")]
    NotFound {
        /// Identity that could not be found
        identity: String,
    },

    /// A temporary failure; the same call may succeed later
    #[error("transient error: {message}")]
    Transient {
        /// Provider message
        message: String,
    },

    /// A permanent failure such as a quota or an invalid value
    #[error("rejected: {message}")]
    Rejected {
        /// Provider message
        message: String,
    },
}

impl ProviderError {
    pub fn not_found(identity: impl Into<String>) -> Self {
        Self::NotFound {
            identity: identity.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Rejected { .. } => ErrorCategory::Rejected,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }
}

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Outcome of a successful create
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Provider-assigned identity
    pub identity: String,
    /// Live attributes, including computed ones
    pub attributes: Attributes,
}

/// Client for an infrastructure API.
///
/// Calls are made from worker threads, one call per plan entry at a time.
/// Attributes passed in are always fully resolved.
pub trait Provider: Send + Sync {
    /// Create an object and return its identity and live attributes
    fn create(&self, address: &Address, attributes: &Attributes) -> ProviderResult<Created>;

    /// Read live attributes, or `NotFound` if the object is gone
    fn read(&self, address: &Address, identity: &str) -> ProviderResult<Attributes>;

    /// Update an object in place and return its live attributes
    fn update(
        &self,
        address: &Address,
        identity: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes>;

    /// Delete an object
    fn delete(&self, address: &Address, identity: &str) -> ProviderResult<()>;
}
