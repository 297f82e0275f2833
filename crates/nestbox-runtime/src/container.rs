//! Container lifecycle: create from an imported artifact, destroy once.

use crate::enroot::{self, Enroot, StartOptions};
use crate::error::{Result, RuntimeError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Prefix shared by every container this crate creates.
///
/// Leftovers from crashed processes can be removed in bulk by listing
/// containers with this prefix.
pub const CONTAINER_PREFIX: &str = "nestbox-";

/// Attempts made with fresh names when a generated name is already taken.
const CREATE_ATTEMPTS: usize = 3;

/// Budget for removing a partially created container.
const UNWIND_TIMEOUT: Duration = Duration::from_secs(30);

/// Generate a fresh container name: the prefix plus 12 random hex digits.
pub fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{CONTAINER_PREFIX}{}", &id[..12])
}

/// Options applied whenever a command runs in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Root filesystem is writable.
    pub writable: bool,
    /// Commands run as root inside the container.
    pub root: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            writable: true,
            root: false,
        }
    }
}

/// Current state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created and able to run commands.
    Ready,
    /// Removed from the runtime.
    Removed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Ready => write!(f, "ready"),
            ContainerState::Removed => write!(f, "removed"),
        }
    }
}

/// A named container created from an imported artifact.
#[derive(Debug)]
pub struct Container {
    name: String,
    artifact: PathBuf,
    options: ContainerOptions,
    state: ContainerState,
}

impl Container {
    /// Create a uniquely named container from `artifact`.
    ///
    /// A generated name that turns out to be taken is retried with a fresh
    /// one. Any other failure removes whatever the runtime staged before
    /// returning.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Create`] if the runtime rejects the container.
    /// - [`RuntimeError::NameInUse`] if every generated name collided.
    /// - [`RuntimeError::Timeout`] if creation exceeds `timeout`.
    /// - [`RuntimeError::Launch`] if the runtime executable is missing.
    pub async fn create(
        enroot: &Enroot,
        artifact: &Path,
        options: ContainerOptions,
        timeout: Duration,
    ) -> Result<Self> {
        let mut last_err = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            let name = generate_name();
            match Self::create_named(enroot, &name, artifact, options, timeout).await {
                Err(RuntimeError::NameInUse(taken)) => {
                    tracing::warn!(container = %taken, attempt, "Container name in use, retrying");
                    last_err = Some(RuntimeError::NameInUse(taken));
                }
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| RuntimeError::Config("no create attempts made".into())))
    }

    /// Create a container with a caller-chosen name.
    pub async fn create_named(
        enroot: &Enroot,
        name: &str,
        artifact: &Path,
        options: ContainerOptions,
        timeout: Duration,
    ) -> Result<Self> {
        let start = Instant::now();
        tracing::debug!(
            container = %name,
            artifact = %artifact.display(),
            writable = options.writable,
            root = options.root,
            "Creating container"
        );

        let output = match enroot.create(name, artifact, timeout).run().await {
            Ok(output) => output,
            Err(e) => {
                if !matches!(e, RuntimeError::Launch { .. }) {
                    unwind(enroot, name).await;
                }
                return Err(e);
            }
        };

        if !output.success() {
            let reason = output.diagnostic();
            if enroot::reports_name_in_use(&reason, name) {
                // The name belongs to someone else; leave their container alone.
                return Err(RuntimeError::NameInUse(name.to_string()));
            }
            tracing::error!(container = %name, reason = %reason, "Container creation failed");
            unwind(enroot, name).await;
            return Err(RuntimeError::Create {
                name: name.to_string(),
                reason,
            });
        }

        tracing::info!(
            container = %name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Container created"
        );
        Ok(Self {
            name: name.to_string(),
            artifact: artifact.to_path_buf(),
            options,
            state: ContainerState::Ready,
        })
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Artifact the container was created from.
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Options applied to every command.
    pub fn options(&self) -> ContainerOptions {
        self.options
    }

    /// Current state.
    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// `enroot start` options for this container with the given environment.
    pub fn start_options(&self, env: Vec<(String, String)>) -> StartOptions {
        StartOptions {
            writable: self.options.writable,
            root: self.options.root,
            env,
        }
    }

    /// Remove the container.
    ///
    /// Safe to call repeatedly: a container that is already removed, or that
    /// the runtime no longer knows about, counts as destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Remove`] (or a launch/timeout error) if the
    /// runtime could not remove it. The state stays `Ready` so the call can
    /// be retried.
    pub async fn destroy(&mut self, enroot: &Enroot, timeout: Duration) -> Result<()> {
        if self.state == ContainerState::Removed {
            tracing::trace!(container = %self.name, "Container already removed");
            return Ok(());
        }

        tracing::debug!(container = %self.name, "Removing container");
        let output = enroot.remove(&self.name, timeout).run().await?;
        if !output.success() {
            let reason = output.diagnostic();
            if !enroot::reports_missing(&reason) {
                return Err(RuntimeError::Remove {
                    name: self.name.clone(),
                    reason,
                });
            }
            tracing::debug!(container = %self.name, "Container was already gone");
        }

        self.state = ContainerState::Removed;
        tracing::info!(container = %self.name, "Container removed");
        Ok(())
    }
}

/// Best-effort removal of a container whose creation failed.
async fn unwind(enroot: &Enroot, name: &str) {
    match enroot.remove(name, UNWIND_TIMEOUT).run().await {
        Ok(output) if output.success() => {
            tracing::debug!(container = %name, "Removed partially created container");
        }
        Ok(output) if enroot::reports_missing(&output.diagnostic()) => {}
        Ok(output) => tracing::warn!(
            container = %name,
            reason = %output.diagnostic(),
            "Failed to unwind partially created container"
        ),
        Err(e) => tracing::warn!(
            container = %name,
            error = %e,
            "Failed to unwind partially created container"
        ),
    }
}
