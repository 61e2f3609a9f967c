//! Error taxonomy for rolesync
//!
//! Configuration errors are raised before any network I/O. Collaborator
//! errors carry a transient/permanent classification used by the retry logic.

use thiserror::Error;

/// Error raised anywhere in the synchronization pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Wrong shape or type at some point of the configuration tree.
    #[error("{path}: {message}")]
    ConfigFormat { path: String, message: String },

    /// An alias and its canonical key are both present in the same map.
    #[error("{path}: keys '{key}' and '{conflict}' are mutually exclusive")]
    KeyConflict {
        path: String,
        key: String,
        conflict: String,
    },

    /// A membership or grant references a role that is neither wanted nor existing.
    #[error("role '{role}' referenced by {referenced_by} does not exist")]
    UnknownRole { role: String, referenced_by: String },

    /// A template placeholder names an attribute missing from a directory entry.
    #[error("cannot render '{template}': attribute '{attribute}' is missing on {dn}")]
    TemplateSubstitution {
        template: String,
        attribute: String,
        dn: String,
    },

    /// Privilege catalog validation or resolution failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// LDAP or PostgreSQL failure.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The run was cancelled.
    #[error("synchronization cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a configuration format error at `path`.
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::ConfigFormat {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Stable error code, suitable for machine-readable output.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::ConfigFormat { .. } => "CONFIG_FORMAT",
            SyncError::KeyConflict { .. } => "KEY_CONFLICT",
            SyncError::UnknownRole { .. } => "UNKNOWN_ROLE",
            SyncError::TemplateSubstitution { .. } => "TEMPLATE_SUBSTITUTION",
            SyncError::Catalog(err) => err.error_code(),
            SyncError::Collaborator(err) => err.error_code(),
            SyncError::Cancelled => "CANCELLED",
        }
    }

    /// Whether this error stems from the configuration rather than a live system.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigFormat { .. }
                | SyncError::KeyConflict { .. }
                | SyncError::UnknownRole { .. }
                | SyncError::TemplateSubstitution { .. }
                | SyncError::Catalog(_)
        )
    }
}

/// Privilege catalog errors, raised at validation time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// A group or grant rule names a privilege the catalog does not know.
    #[error("privilege '{name}' referenced by '{referenced_by}' is not defined")]
    Undefined { name: String, referenced_by: String },

    /// The group graph loops back on itself.
    #[error("privilege group cycle: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// Two definitions share the same name.
    #[error("privilege '{name}' is defined twice")]
    Duplicate { name: String },
}

impl CatalogError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            CatalogError::Undefined { .. } => "PRIVILEGE_UNDEFINED",
            CatalogError::Cycle { .. } => "PRIVILEGE_CYCLE",
            CatalogError::Duplicate { .. } => "PRIVILEGE_DUPLICATE",
        }
    }
}

/// Failure reported by the LDAP or PostgreSQL collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    // Connection errors (transient)
    /// Failed to reach the server.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The call did not complete in time.
    #[error("timeout after {timeout_secs} seconds: {operation}")]
    Timeout { operation: String, timeout_secs: u64 },

    // Permanent errors
    /// Credentials were rejected.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// A read query failed.
    #[error("query failed: {message}")]
    QueryFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A write statement failed.
    #[error("execution failed: {message}")]
    ExecFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server answered with something we cannot interpret.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
}

impl CollaboratorError {
    /// Check if this error is transient and the call may be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::ConnectionFailed { .. } | CollaboratorError::Timeout { .. }
        )
    }

    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            CollaboratorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            CollaboratorError::Timeout { .. } => "TIMEOUT",
            CollaboratorError::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            CollaboratorError::QueryFailed { .. } => "QUERY_FAILED",
            CollaboratorError::ExecFailed { .. } => "EXEC_FAILED",
            CollaboratorError::InvalidResponse { .. } => "INVALID_RESPONSE",
        }
    }

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        CollaboratorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CollaboratorError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query failed error.
    pub fn query_failed(message: impl Into<String>) -> Self {
        CollaboratorError::QueryFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a query failed error with source.
    pub fn query_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CollaboratorError::QueryFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an execution failed error.
    pub fn exec_failed(message: impl Into<String>) -> Self {
        CollaboratorError::ExecFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an execution failed error with source.
    pub fn exec_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CollaboratorError::ExecFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        CollaboratorError::InvalidResponse {
            message: message.into(),
        }
    }
}

/// Result type for pipeline operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for collaborator calls.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(CollaboratorError::connection_failed("refused").is_transient());
        assert!(CollaboratorError::Timeout {
            operation: "search".into(),
            timeout_secs: 10
        }
        .is_transient());

        assert!(!CollaboratorError::query_failed("syntax error").is_transient());
        assert!(!CollaboratorError::AuthenticationFailed {
            message: "bad password".into()
        }
        .is_transient());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(SyncError::config("sync_map", "must be a list").is_config_error());
        assert!(SyncError::from(CatalogError::Duplicate {
            name: "__ro__".into()
        })
        .is_config_error());
        assert!(
            !SyncError::from(CollaboratorError::exec_failed("permission denied"))
                .is_config_error()
        );
        assert!(!SyncError::Cancelled.is_config_error());
    }

    #[test]
    fn test_cycle_display_lists_chain() {
        let err = CatalogError::Cycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "privilege group cycle: a -> b -> a");
        assert_eq!(SyncError::from(err).error_code(), "PRIVILEGE_CYCLE");
    }

    #[test]
    fn test_error_with_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = CollaboratorError::connection_failed_with_source("ldap://localhost", io_err);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_without_source() {
        let err = CollaboratorError::exec_failed("permission denied");
        assert!(std::error::Error::source(&err).is_none());
        let err = SyncError::from(CollaboratorError::query_failed("syntax error"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
