//! Command execution inside a container.
//!
//! Each call is a fresh `enroot start` whose program is the configured shell
//! running `cd <dir> && <command>`. Nothing carries over between calls: the
//! working directory is set per call, and forwarded host variables are read
//! at call time.

use crate::config::EnvironmentConfig;
use crate::error::Result;
use nestbox_runtime::{Container, ContainerState, Enroot, Invocation, RuntimeError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::{Duration, Instant};

/// Budget for checking whether a container still exists after a failed exec.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix enroot puts on its own error messages.
const RUNTIME_ERROR_PREFIX: &str = "[ERROR]";

/// A single command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Shell command line; pipes, expansions and the like are allowed.
    pub command: String,
    /// Working directory for this call only.
    pub cwd: Option<String>,
    /// Timeout for this call only.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// Run `command` with the environment's defaults.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout: None,
        }
    }

    /// Override the working directory for this call.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Override the timeout for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    /// Combined stdout and stderr.
    pub output: String,
    /// Exit code of the command; 0 means success.
    pub returncode: i32,
    /// Wall-clock time of the call in milliseconds.
    pub duration_ms: u64,
}

impl ExecResult {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Runs commands in a container according to an environment's policy.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    enroot: Enroot,
    shell: String,
    cwd: String,
    env: BTreeMap<String, String>,
    forward_env: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    /// Executor applying `config`'s shell, cwd, environment and timeout.
    pub fn new(enroot: Enroot, config: &EnvironmentConfig) -> Self {
        Self {
            enroot,
            shell: config.shell.clone(),
            cwd: config.cwd.clone(),
            env: config.env.clone(),
            forward_env: config.forward_env.clone(),
            timeout: config.timeout,
        }
    }

    /// Environment for a call: forwarded host variables present right now,
    /// overlaid with the explicit ones.
    pub fn environment(&self) -> Vec<(String, String)> {
        self.environment_with(|k: &str| std::env::var_os(k))
    }

    fn environment_with<F>(&self, lookup: F) -> Vec<(String, String)>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut merged = BTreeMap::new();
        for name in &self.forward_env {
            match lookup(name).map(OsString::into_string) {
                Some(Ok(value)) => {
                    merged.insert(name.clone(), value);
                }
                Some(Err(_)) => {
                    tracing::debug!(var = %name, "Skipping non-UTF-8 forwarded variable");
                }
                None => {}
            }
        }
        for (key, value) in &self.env {
            merged.insert(key.clone(), value.clone());
        }
        merged.into_iter().collect()
    }

    /// Script handed to the shell: change directory, then run the command.
    pub fn script(&self, command: &str, cwd: Option<&str>) -> String {
        let dir = cwd.filter(|d| !d.is_empty()).unwrap_or(&self.cwd);
        format!("cd {} && {}", shell_quote(dir), command)
    }

    /// The runtime invocation for `request`.
    pub fn invocation(&self, container: &Container, request: &ExecRequest) -> Invocation {
        let script = self.script(&request.command, request.cwd.as_deref());
        let options = container.start_options(self.environment());
        self.enroot
            .start(
                container.name(),
                &options,
                [self.shell.clone(), "-c".to_string(), script],
                request.timeout.unwrap_or(self.timeout),
            )
            .merge_output()
    }

    /// Run `request` in `container`.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Timeout`] if the command outlives its budget. Its
    ///   process tree is killed, so the container stays usable.
    /// - [`RuntimeError::Exec`] if the container is removed or disappeared.
    /// - [`RuntimeError::Launch`] if the runtime executable is missing.
    ///
    /// A non-zero exit code is returned in [`ExecResult::returncode`].
    pub async fn exec_in(&self, container: &Container, request: &ExecRequest) -> Result<ExecResult> {
        if container.state() != ContainerState::Ready {
            return Err(RuntimeError::Exec {
                name: container.name().to_string(),
                reason: format!("container is {}", container.state()),
            }
            .into());
        }

        let start = Instant::now();
        let output = self.invocation(container, request).run().await?;

        if !output.success() && output.stdout.starts_with(RUNTIME_ERROR_PREFIX) {
            // Could be the runtime failing rather than the command.
            match self.enroot.exists(container.name(), PROBE_TIMEOUT).await {
                Ok(false) => {
                    tracing::error!(
                        container = %container.name(),
                        output = %output.stdout.trim(),
                        "Container disappeared"
                    );
                    return Err(RuntimeError::Exec {
                        name: container.name().to_string(),
                        reason: format!("container no longer exists: {}", output.diagnostic()),
                    }
                    .into());
                }
                Ok(true) => {}
                Err(e) => tracing::warn!(
                    container = %container.name(),
                    error = %e,
                    "Could not verify container after failed command"
                ),
            }
        }

        Ok(ExecResult {
            output: output.stdout,
            returncode: output.exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Quote `s` as a single shell word.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
