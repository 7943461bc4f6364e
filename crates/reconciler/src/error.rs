//! Error types for the revision reconciler.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ResourceKind;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Every variant is recoverable: the dispatch loop turns any error returned
/// from a sync pass into a rate-limited requeue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A config map or secret does not exist.
    #[error("{} \"{name}\" not found in namespace \"{namespace}\"", kind.resource())]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    /// Optimistic-concurrency rejection on a status write.
    #[error("operation cannot be fulfilled on \"{name}\": resource version is {actual}, update was based on {expected}")]
    Conflict {
        name: String,
        expected: String,
        actual: String,
    },

    /// The revision counter was advanced by another writer while the next
    /// revision was being created.
    #[error("latest available revision moved from {expected} to {actual} while creating revision {next}")]
    RevisionMoved { expected: u32, actual: u32, next: u32 },

    /// A requeue was requested without a concrete error.
    #[error("synthetic requeue request")]
    SyntheticRequeue,

    /// The backing store failed.
    #[error("store operation '{operation}' failed: {reason}")]
    Store { operation: String, reason: String },

    /// The revision counter cannot advance any further.
    #[error("revision {revision} cannot be advanced")]
    RevisionOverflow { revision: u32 },

    /// Invalid controller configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Configuration file could not be read.
    #[error("failed to read config file '{path}': {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    /// Configuration file could not be parsed.
    #[error("TOML parse error: {reason}")]
    ConfigParse { reason: String },
}

impl Error {
    /// Create a not found error.
    pub fn not_found(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a resource version conflict error.
    pub fn conflict(
        name: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            name: name.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a store failed error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a config read error.
    pub fn config_read(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigRead {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a config parse error.
    pub fn config_parse(reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            reason: reason.into(),
        }
    }

    /// Whether this error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error reports a concurrent write, either a stale
    /// resource version or a moved revision counter.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::RevisionMoved { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found(ResourceKind::ConfigMap, "ns", "config-0");
        assert_eq!(
            err.to_string(),
            "configmaps \"config-0\" not found in namespace \"ns\""
        );
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_secret_not_found_names_resource() {
        let err = Error::not_found(ResourceKind::Secret, "ns", "serving-cert");
        assert!(err.to_string().starts_with("secrets \"serving-cert\""));
    }

    #[test]
    fn test_conflict() {
        let err = Error::conflict("cluster", "3", "4");
        assert!(err.is_conflict());
        assert!(err.to_string().contains("based on 3"));
    }

    #[test]
    fn test_revision_moved_is_conflict_with_revision_wording() {
        let err = Error::RevisionMoved {
            expected: 0,
            actual: 3,
            next: 1,
        };
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "latest available revision moved from 0 to 3 while creating revision 1"
        );
        assert!(!err.to_string().contains("resource version"));
    }
}
