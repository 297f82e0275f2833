//! Error types for nestbox-core.

use crate::environment::EnvironmentState;
use nestbox_runtime::{Phase, RuntimeError};
use thiserror::Error;

/// Result type alias for nestbox-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during environment operations.
///
/// A non-zero exit code from the caller's command is never an error; it is
/// returned in [`ExecResult::returncode`](crate::ExecResult::returncode).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from nestbox-runtime
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Operation not valid in the environment's current state
    #[error("cannot {operation}: environment is {state}")]
    Lifecycle {
        /// Operation that was attempted
        operation: &'static str,
        /// State the environment was in
        state: EnvironmentState,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The runtime executable could not be started.
    Launch,
    /// A phase exceeded its timeout.
    Timeout(Phase),
    /// Image import failed.
    Import,
    /// Container creation failed.
    ContainerCreate,
    /// Exec protocol failure or container removal failure.
    Exec,
    /// Operation invalid in the current state.
    Lifecycle,
    /// Invalid configuration.
    Config,
    /// Local I/O failure.
    Io,
}

impl CoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Runtime(e) => match e {
                RuntimeError::Launch { .. } => ErrorKind::Launch,
                RuntimeError::Timeout { phase, .. } => ErrorKind::Timeout(*phase),
                RuntimeError::InvalidImage { .. } | RuntimeError::Import { .. } => {
                    ErrorKind::Import
                }
                RuntimeError::Create { .. } | RuntimeError::NameInUse(_) => {
                    ErrorKind::ContainerCreate
                }
                RuntimeError::Remove { .. } | RuntimeError::Exec { .. } => ErrorKind::Exec,
                RuntimeError::Config(_) => ErrorKind::Config,
                RuntimeError::Io(_) => ErrorKind::Io,
            },
            CoreError::Lifecycle { .. } => ErrorKind::Lifecycle,
            CoreError::Config(_) | CoreError::Json(_) => ErrorKind::Config,
            CoreError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this is a timeout in any phase.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout(_))
    }
}
