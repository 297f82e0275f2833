//! Environment configuration types.

use crate::error::CoreError;
use nestbox_runtime::{ContainerOptions, ImageCache, DEFAULT_EXECUTABLE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted for the runtime executable when the
/// configuration does not name one.
pub const EXECUTABLE_ENV_VAR: &str = "NESTBOX_ENROOT_EXECUTABLE";

/// Where imported images are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageStore {
    /// Shared on-disk cache, reused across environments and processes.
    Shared {
        /// Cache root directory.
        path: PathBuf,
    },
    /// Per-environment staging directory, deleted at cleanup.
    Ephemeral,
}

impl Default for ImageStore {
    fn default() -> Self {
        ImageStore::Shared {
            path: ImageCache::default_root(),
        }
    }
}

/// Configuration for creating an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Source image, e.g. `docker://python:3.11-slim`.
    pub image: String,
    /// Default working directory for commands (default: `/`).
    pub cwd: String,
    /// Variables set for every command. These win over forwarded ones.
    pub env: BTreeMap<String, String>,
    /// Host variables forwarded to every command when set on the host.
    pub forward_env: Vec<String>,
    /// Per-command timeout (default: 30s).
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Image import timeout (default: 300s).
    #[serde(with = "duration_secs")]
    pub import_timeout: Duration,
    /// Container creation timeout (default: 120s).
    #[serde(with = "duration_secs")]
    pub create_timeout: Duration,
    /// Container removal timeout (default: 30s).
    #[serde(with = "duration_secs")]
    pub remove_timeout: Duration,
    /// Writable root filesystem (default: true).
    pub writable: bool,
    /// Run as root inside the container (default: false).
    pub root: bool,
    /// Shell inside the container that interprets commands (default: `bash`).
    pub shell: String,
    /// Runtime executable. Unset means [`EXECUTABLE_ENV_VAR`], then `enroot`.
    pub executable: Option<PathBuf>,
    /// Image storage (default: shared cache).
    pub image_store: ImageStore,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            cwd: "/".into(),
            env: BTreeMap::new(),
            forward_env: Vec::new(),
            timeout: Duration::from_secs(30),
            import_timeout: Duration::from_secs(300),
            create_timeout: Duration::from_secs(120),
            remove_timeout: Duration::from_secs(30),
            writable: true,
            root: false,
            shell: "bash".into(),
            executable: None,
            image_store: ImageStore::default(),
        }
    }
}

impl EnvironmentConfig {
    /// Default configuration for `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Create a new config builder.
    pub fn builder() -> EnvironmentConfigBuilder {
        EnvironmentConfigBuilder::default()
    }

    /// Resolve the runtime executable.
    ///
    /// Reads [`EXECUTABLE_ENV_VAR`] from the process environment, so call it
    /// once when an environment is constructed.
    pub fn resolve_executable(&self) -> PathBuf {
        self.resolve_executable_with(|k: &str| std::env::var_os(k))
    }

    fn resolve_executable_with<F>(&self, lookup: F) -> PathBuf
    where
        F: FnOnce(&str) -> Option<OsString>,
    {
        self.executable
            .clone()
            .or_else(|| {
                lookup(EXECUTABLE_ENV_VAR)
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE))
    }

    /// Container options derived from this configuration.
    pub fn container_options(&self) -> ContainerOptions {
        ContainerOptions {
            writable: self.writable,
            root: self.root,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image.trim().is_empty() {
            return Err(CoreError::Config("image is required".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(CoreError::Config("shell must not be empty".into()));
        }
        if !self.cwd.starts_with('/') {
            return Err(CoreError::Config(format!(
                "cwd must be an absolute path, got '{}'",
                self.cwd
            )));
        }
        for (name, value) in [
            ("timeout", self.timeout),
            ("import_timeout", self.import_timeout),
            ("create_timeout", self.create_timeout),
            ("remove_timeout", self.remove_timeout),
        ] {
            if value.is_zero() {
                return Err(CoreError::Config(format!("{name} must be > 0")));
            }
        }
        for (key, value) in &self.env {
            validate_var_name(key)?;
            if value.contains('\0') {
                return Err(CoreError::Config(format!(
                    "value of env var '{key}' contains a NUL byte"
                )));
            }
        }
        for key in &self.forward_env {
            validate_var_name(key)?;
        }
        Ok(())
    }
}

fn validate_var_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(CoreError::Config(format!(
            "invalid environment variable name '{name}'"
        )));
    }
    Ok(())
}

/// Builder for EnvironmentConfig.
#[derive(Debug, Default)]
pub struct EnvironmentConfigBuilder {
    config: EnvironmentConfig,
}

impl EnvironmentConfigBuilder {
    /// Set the source image.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Set the default working directory.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.config.cwd = cwd.into();
        self
    }

    /// Set one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.config
            .env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Forward a host variable.
    pub fn forward_env(mut self, name: impl Into<String>) -> Self {
        self.config.forward_env.push(name.into());
        self
    }

    /// Set the per-command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the image import timeout.
    pub fn import_timeout(mut self, timeout: Duration) -> Self {
        self.config.import_timeout = timeout;
        self
    }

    /// Set the container creation timeout.
    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.config.create_timeout = timeout;
        self
    }

    /// Set the container removal timeout.
    pub fn remove_timeout(mut self, timeout: Duration) -> Self {
        self.config.remove_timeout = timeout;
        self
    }

    /// Make the root filesystem writable or read-only.
    pub fn writable(mut self, writable: bool) -> Self {
        self.config.writable = writable;
        self
    }

    /// Run commands as root inside the container.
    pub fn root(mut self, root: bool) -> Self {
        self.config.root = root;
        self
    }

    /// Set the shell that interprets commands inside the container.
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.config.shell = shell.into();
        self
    }

    /// Set the runtime executable.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.executable = Some(path.into());
        self
    }

    /// Use a shared image cache at `path`.
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.image_store = ImageStore::Shared { path: path.into() };
        self
    }

    /// Import images into a per-environment directory removed at cleanup.
    pub fn ephemeral_images(mut self) -> Self {
        self.config.image_store = ImageStore::Ephemeral;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<EnvironmentConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Durations as (fractional) seconds.
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EnvironmentConfig::new("docker://python:3.11");
        assert_eq!(config.image, "docker://python:3.11");
        assert_eq!(config.cwd, "/");
        assert!(config.env.is_empty());
        assert!(config.forward_env.is_empty());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.import_timeout, Duration::from_secs(300));
        assert_eq!(config.create_timeout, Duration::from_secs(120));
        assert!(config.writable);
        assert!(!config.root);
        assert_eq!(config.shell, "bash");
        assert!(config.executable.is_none());
        assert!(matches!(config.image_store, ImageStore::Shared { .. }));
    }

    #[test]
    fn test_builder_validation_missing_image() {
        let result = EnvironmentConfig::builder().cwd("/tmp").build();
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_builder_validation_relative_cwd() {
        let result = EnvironmentConfig::builder()
            .image("docker://alpine")
            .cwd("work")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_validation_zero_timeout() {
        let result = EnvironmentConfig::builder()
            .image("docker://alpine")
            .import_timeout(Duration::ZERO)
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("import_timeout"));
    }

    #[test]
    fn test_builder_validation_env_names() {
        assert!(EnvironmentConfig::builder()
            .image("docker://alpine")
            .env("A=B", "x")
            .build()
            .is_err());
        assert!(EnvironmentConfig::builder()
            .image("docker://alpine")
            .forward_env("")
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = EnvironmentConfig::builder()
            .image("docker://python:3.11-slim")
            .cwd("/testbed")
            .env("PAGER", "cat")
            .envs([("A", "1"), ("B", "2")])
            .forward_env("HF_TOKEN")
            .timeout(Duration::from_secs(60))
            .writable(false)
            .root(true)
            .executable("/opt/enroot/bin/enroot")
            .ephemeral_images()
            .build()
            .expect("should build successfully");

        assert_eq!(config.cwd, "/testbed");
        assert_eq!(config.env.len(), 3);
        assert_eq!(config.forward_env, ["HF_TOKEN"]);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(
            config.container_options(),
            ContainerOptions {
                writable: false,
                root: true
            }
        );
        assert_eq!(config.image_store, ImageStore::Ephemeral);
        assert_eq!(
            config.resolve_executable(),
            PathBuf::from("/opt/enroot/bin/enroot")
        );
    }

    #[test]
    fn test_resolve_executable_from_env() {
        let config = EnvironmentConfig::new("docker://alpine");
        let from_env = config.resolve_executable_with(|name| {
            assert_eq!(name, EXECUTABLE_ENV_VAR);
            Some(OsString::from("/custom/enroot"))
        });
        assert_eq!(from_env, PathBuf::from("/custom/enroot"));
        assert_eq!(
            config.resolve_executable_with(|_| Some(OsString::new())),
            PathBuf::from("enroot")
        );
        assert_eq!(config.resolve_executable_with(|_| None), PathBuf::from("enroot"));

        let explicit = EnvironmentConfig {
            executable: Some("/opt/enroot".into()),
            ..config
        };
        assert_eq!(
            explicit.resolve_executable_with(|_| Some(OsString::from("/custom/enroot"))),
            PathBuf::from("/opt/enroot")
        );
    }

    #[test]
    fn test_serialized_form() {
        let config = EnvironmentConfig::builder()
            .image("docker://alpine")
            .cwd("/tmp")
            .env("KEY", "VALUE")
            .cache_dir("/var/cache/nestbox")
            .build()
            .unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["image"], "docker://alpine");
        assert_eq!(value["cwd"], "/tmp");
        assert_eq!(value["env"]["KEY"], "VALUE");
        assert_eq!(value["timeout"], 30.0);
        assert_eq!(value["image_store"]["kind"], "shared");

        let back: EnvironmentConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }
}
