//! Error types for nestbox-runtime.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for nestbox-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Lifecycle phase a runtime invocation belongs to.
///
/// Every phase carries its own timeout budget, so a timeout error always
/// names the phase that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Converting a source image into a local artifact.
    Import,
    /// Unpacking an artifact into a named container.
    Create,
    /// Running a command inside a container.
    Exec,
    /// Removing a container.
    Remove,
    /// Listing containers.
    List,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Import => write!(f, "import"),
            Phase::Create => write!(f, "create"),
            Phase::Exec => write!(f, "exec"),
            Phase::Remove => write!(f, "remove"),
            Phase::List => write!(f, "list"),
        }
    }
}

/// Errors that can occur while driving the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime executable could not be started
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// Program that failed to start
        program: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// A runtime invocation exceeded its phase budget
    #[error("{phase} timed out after {timeout:?}")]
    Timeout {
        /// Phase that timed out
        phase: Phase,
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// The image reference was rejected before reaching the runtime
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImage { reference: String, reason: String },

    /// Image import or conversion failed
    #[error("failed to import image '{image}': {reason}")]
    Import { image: String, reason: String },

    /// Container creation failed
    #[error("failed to create container '{name}': {reason}")]
    Create { name: String, reason: String },

    /// The generated container name is already taken
    #[error("container name already in use: {0}")]
    NameInUse(String),

    /// Container removal failed
    #[error("failed to remove container '{name}': {reason}")]
    Remove { name: String, reason: String },

    /// Exec protocol failure, distinct from a non-zero exit code
    #[error("exec failed in container '{name}': {reason}")]
    Exec { name: String, reason: String },

    /// Invalid invocation parameters
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Phase of a timeout error, if this is one.
    pub fn timeout_phase(&self) -> Option<Phase> {
        match self {
            RuntimeError::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
