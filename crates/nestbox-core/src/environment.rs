//! Environment facade - one container, many commands.

use crate::config::{EnvironmentConfig, ImageStore};
use crate::error::{CoreError, Result};
use crate::exec::{CommandExecutor, ExecRequest, ExecResult};
use chrono::{DateTime, Utc};
use nestbox_runtime::{
    CachedImage, Container, ContainerState, Enroot, ImageCache, ImageReference, RuntimeError,
};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Lifecycle state of an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    /// Not yet provisioned.
    Uninitialized,
    /// Container exists and accepts commands.
    Ready,
    /// Container is unreachable; only cleanup is valid.
    Degraded,
    /// Resources released; no further commands.
    CleanedUp,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::CleanedUp => write!(f, "cleaned up"),
        }
    }
}

/// What a call to [`Environment::cleanup`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Container removed by this call, if any.
    pub container: Option<String>,
    /// Problems encountered; cleanup carries on past each of them.
    pub warnings: Vec<String>,
}

impl CleanupReport {
    /// Whether cleanup finished without warnings.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug)]
struct Inner {
    state: EnvironmentState,
    container: Option<Container>,
    staging_dir: Option<PathBuf>,
}

/// An isolated execution environment backed by one rootless container.
///
/// Commands run one at a time; concurrent callers of [`execute`](Self::execute)
/// wait their turn. Release the container with [`cleanup`](Self::cleanup), or
/// use [`Environment::scoped`]. Dropping an environment that was never cleaned
/// up removes its container in the background on a best-effort basis.
#[derive(Debug)]
pub struct Environment {
    config: EnvironmentConfig,
    enroot: Enroot,
    executor: CommandExecutor,
    image: CachedImage,
    container_name: String,
    created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl Environment {
    /// Provision an environment: import the image if needed, then create
    /// the container.
    ///
    /// Anything staged before a failure is removed again, and the original
    /// error is returned.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Config`] for an invalid configuration.
    /// - [`CoreError::Runtime`] for import, create, launch or timeout failures.
    pub async fn new(config: EnvironmentConfig) -> Result<Self> {
        config.validate()?;
        let enroot = Enroot::new(config.resolve_executable());
        let image = ImageReference::new(config.image.clone())?;
        let start = Instant::now();
        tracing::info!(
            image = %image,
            executable = %enroot.executable().display(),
            "Creating environment"
        );

        let (cache, staging_dir) = match &config.image_store {
            ImageStore::Shared { path } => (ImageCache::new(path), None),
            ImageStore::Ephemeral => {
                let dir = std::env::temp_dir()
                    .join(format!("nestbox-images-{}", uuid::Uuid::new_v4().simple()));
                tracing::debug!(path = %dir.display(), "Using ephemeral image store");
                (ImageCache::new(&dir), Some(dir))
            }
        };

        let provisioned = async {
            let cached = cache
                .ensure_imported(&enroot, &image, config.import_timeout)
                .await?;
            let container = Container::create(
                &enroot,
                &cached.path,
                config.container_options(),
                config.create_timeout,
            )
            .await?;
            Ok::<_, RuntimeError>((cached, container))
        }
        .await;

        let (cached, container) = match provisioned {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(image = %image, error = %e, "Environment creation failed");
                if let Some(dir) = &staging_dir {
                    if let Err(purge) = purge_dir(dir).await {
                        tracing::warn!(
                            path = %dir.display(),
                            error = %purge,
                            "Failed to remove ephemeral image store"
                        );
                    }
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            container = %container.name(),
            image = %image,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Environment ready"
        );
        Ok(Self {
            executor: CommandExecutor::new(enroot.clone(), &config),
            container_name: container.name().to_string(),
            config,
            enroot,
            image: cached,
            created_at: Utc::now(),
            inner: Mutex::new(Inner {
                state: EnvironmentState::Ready,
                container: Some(container),
                staging_dir,
            }),
        })
    }

    /// Provision an environment, run `f` with it, then clean up.
    ///
    /// Cleanup runs whether `f` succeeds or fails. If `f` panics, the drop
    /// safety net removes the container instead.
    pub async fn scoped<F, Fut, T>(config: EnvironmentConfig, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Environment>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let env = Arc::new(Self::new(config).await?);
        let result = f(Arc::clone(&env)).await;
        let report = env.cleanup().await;
        if !report.is_clean() {
            tracing::warn!(
                container = %env.container_name(),
                warnings = ?report.warnings,
                "Scoped environment cleanup incomplete"
            );
        }
        result
    }

    /// Run a shell command, optionally in a different working directory.
    ///
    /// A non-zero exit status is returned in [`ExecResult::returncode`], not
    /// as an error.
    pub async fn execute(&self, command: &str, cwd: Option<&str>) -> Result<ExecResult> {
        let mut request = ExecRequest::new(command);
        if let Some(cwd) = cwd {
            request = request.cwd(cwd);
        }
        self.run(request).await
    }

    /// Run a request with per-call overrides.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Lifecycle`] unless the environment is ready.
    /// - [`CoreError::Runtime`] with a timeout; the environment stays ready.
    /// - [`CoreError::Runtime`] with an exec failure when the container has
    ///   gone away; the environment becomes degraded.
    pub async fn run(&self, request: ExecRequest) -> Result<ExecResult> {
        let mut inner = self.inner.lock().await;
        if inner.state != EnvironmentState::Ready {
            return Err(CoreError::Lifecycle {
                operation: "execute",
                state: inner.state,
            });
        }
        let Some(container) = inner.container.as_ref() else {
            return Err(CoreError::Lifecycle {
                operation: "execute",
                state: inner.state,
            });
        };

        tracing::debug!(
            container = %self.container_name,
            command = %request.command,
            cwd = ?request.cwd,
            "Executing command"
        );
        match self.executor.exec_in(container, &request).await {
            Ok(result) => {
                tracing::debug!(
                    container = %self.container_name,
                    returncode = result.returncode,
                    output_len = result.output.len(),
                    elapsed_ms = result.duration_ms,
                    "Command completed"
                );
                tracing::trace!(container = %self.container_name, output = %result.output);
                Ok(result)
            }
            Err(e @ CoreError::Runtime(RuntimeError::Exec { .. })) => {
                tracing::error!(
                    container = %self.container_name,
                    error = %e,
                    "Container unreachable, environment degraded"
                );
                inner.state = EnvironmentState::Degraded;
                Err(e)
            }
            Err(e) => {
                tracing::warn!(container = %self.container_name, error = %e, "Command failed");
                Err(e)
            }
        }
    }

    /// Remove the container and any ephemeral image store.
    ///
    /// Safe to call repeatedly and from any state. Problems are collected in
    /// the report instead of being returned.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut inner = self.inner.lock().await;
        let mut report = CleanupReport::default();

        if let Some(container) = inner.container.as_mut() {
            if container.state() == ContainerState::Ready {
                match container
                    .destroy(&self.enroot, self.config.remove_timeout)
                    .await
                {
                    Ok(()) => report.container = Some(container.name().to_string()),
                    Err(e) => {
                        tracing::warn!(
                            container = %container.name(),
                            error = %e,
                            "Failed to remove container"
                        );
                        report
                            .warnings
                            .push(format!("failed to remove container {}: {e}", container.name()));
                    }
                }
            }
        }

        if let Some(dir) = inner.staging_dir.take() {
            if let Err(e) = purge_dir(&dir).await {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to remove ephemeral image store"
                );
                report.warnings.push(format!(
                    "failed to remove image store {}: {e}",
                    dir.display()
                ));
            }
        }

        if inner.state != EnvironmentState::CleanedUp {
            tracing::info!(
                container = %self.container_name,
                warnings = report.warnings.len(),
                "Environment cleaned up"
            );
        }
        inner.state = EnvironmentState::CleanedUp;
        report
    }

    /// The configuration as a JSON object, for prompt templating.
    pub fn template_vars(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> EnvironmentState {
        self.inner.lock().await.state
    }

    /// Whether commands are accepted.
    pub async fn is_ready(&self) -> bool {
        self.state().await == EnvironmentState::Ready
    }

    /// Name of the backing container.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Imported image the container was created from.
    pub fn image(&self) -> &CachedImage {
        &self.image
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Configuration this environment was created with.
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let container = inner
            .container
            .as_ref()
            .filter(|c| c.state() == ContainerState::Ready)
            .map(|c| c.name().to_string());
        let staging_dir = inner.staging_dir.take();
        if container.is_none() && staging_dir.is_none() {
            return;
        }

        tracing::warn!(
            container = ?container,
            "Environment dropped without cleanup, removing in background"
        );
        let executable = self.enroot.executable().to_path_buf();
        let timeout = self.config.remove_timeout;
        let spawned = std::thread::Builder::new()
            .name("nestbox-reaper".into())
            .spawn(move || {
                reap(&executable, container.as_deref(), staging_dir.as_deref(), timeout)
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Failed to start background cleanup");
        }
    }
}

/// Synchronous removal used once no async context can be relied on.
///
/// The runtime call gets at most `timeout`; the store is removed either way.
fn reap(executable: &Path, container: Option<&str>, staging_dir: Option<&Path>, timeout: Duration) {
    if let Some(name) = container {
        let status = std::process::Command::new(executable)
            .args(["remove", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .and_then(|mut child| wait_bounded(&mut child, timeout));
        match status {
            Ok(Some(s)) if s.success() => tracing::debug!(container = %name, "Container reaped"),
            Ok(Some(s)) => tracing::warn!(container = %name, status = %s, "Background removal failed"),
            Ok(None) => tracing::warn!(
                container = %name,
                timeout_secs = timeout.as_secs_f64(),
                "Background removal timed out"
            ),
            Err(e) => tracing::warn!(container = %name, error = %e, "Background removal failed"),
        }
    }
    if let Some(dir) = staging_dir {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to remove image store");
            }
        }
    }
}

/// Wait for `child` for at most `timeout`, killing it when the budget runs out.
///
/// Returns `None` on timeout.
fn wait_bounded(
    child: &mut std::process::Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    const POLL: Duration = Duration::from_millis(50);

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL);
    }
}

async fn purge_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(EnvironmentState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(EnvironmentState::Ready.to_string(), "ready");
        assert_eq!(EnvironmentState::Degraded.to_string(), "degraded");
        assert_eq!(EnvironmentState::CleanedUp.to_string(), "cleaned up");
    }

    #[test]
    fn test_cleanup_report() {
        let mut report = CleanupReport::default();
        assert!(report.is_clean());
        report.warnings.push("remove timed out".into());
        assert!(!report.is_clean());
    }

    #[test]
    fn test_wait_bounded_kills_stuck_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let start = Instant::now();
        let status = wait_bounded(&mut child, Duration::from_millis(200)).unwrap();
        assert!(status.is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
        // Already reaped
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_wait_bounded_returns_status() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let status = wait_bounded(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(status.and_then(|s| s.code()), Some(3));
    }

    #[test]
    fn test_reap_gives_up_on_hung_runtime() {
        let temp = tempfile::TempDir::new().unwrap();
        let hung = temp.path().join("enroot");
        std::fs::write(&hung, "#!/bin/sh\nexec sleep 5\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hung, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let store = temp.path().join("store");
        std::fs::create_dir(&store).unwrap();

        let start = Instant::now();
        reap(&hung, Some("nestbox-000000000000"), Some(&store), Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(!store.exists());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let err = Environment::new(EnvironmentConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_new_with_missing_runtime() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = EnvironmentConfig::builder()
            .image("docker://alpine:3.19")
            .executable("/nonexistent/enroot")
            .cache_dir(temp.path())
            .build()
            .unwrap();
        let err = Environment::new(config).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Launch);
    }

    #[tokio::test]
    async fn test_purge_dir_missing_is_ok() {
        let temp = tempfile::TempDir::new().unwrap();
        purge_dir(&temp.path().join("absent")).await.unwrap();
    }
}
