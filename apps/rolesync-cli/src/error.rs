//! CLI error types and exit codes

use std::path::PathBuf;

use thiserror::Error;

use rolesync_core::{CollaboratorError, SyncError};

/// Exit codes for the CLI
/// - 0: Success
/// - 1: Execution or internal failure
/// - 2: Configuration error
/// - 3: Connection or collaborator error
/// - 4: Changes pending (`--check`)
/// - 130: Cancelled
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("No configuration file found. Searched:\n{}", format_paths(.searched))]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("{failed} action(s) failed")]
    ExecutionFailed { failed: usize },

    #[error("{count} change(s) pending")]
    ChangesPending { count: usize },

    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::ConfigNotFound { .. } | CliError::Config(_) => 2,
            CliError::Connection(_) => 3,
            CliError::ChangesPending { .. } => 4,
            CliError::Cancelled => 130,
            CliError::ExecutionFailed { .. } | CliError::Io(_) | CliError::Internal(_) => 1,
        }
    }

    /// Print the error to stderr with appropriate formatting
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();

        if let CliError::ChangesPending { .. } = self {
            eprintln!("{self}");
            return;
        }

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {self}");
        } else {
            eprintln!("Error: {self}");
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {suggestion}");
            } else {
                eprintln!("\nSuggestion: {suggestion}");
            }
        }
    }

    /// Get a suggested action for this error
    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::ConfigNotFound { .. } => {
                Some("Pass --config PATH or set ROLESYNC_CONFIG.")
            }
            CliError::Connection(_) => Some(
                "Check LDAPURI, LDAPBINDDN and DATABASE_URL (or the PG* variables).",
            ),
            CliError::ExecutionFailed { .. } => {
                Some("Re-run without --real to review the remaining plan.")
            }
            _ => None,
        }
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Cancelled => CliError::Cancelled,
            SyncError::Collaborator(inner) => CliError::from(inner),
            other if other.is_config_error() => CliError::Config(other.to_string()),
            other => CliError::Internal(other.to_string()),
        }
    }
}

impl From<CollaboratorError> for CliError {
    fn from(e: CollaboratorError) -> Self {
        CliError::Connection(e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Internal(format!("JSON error: {e}"))
    }
}
