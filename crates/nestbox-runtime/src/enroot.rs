//! The enroot command-line surface.
//!
//! Every management subcommand is built as an argument vector. The only
//! place a shell ever sees caller-controlled text is the program handed to
//! `enroot start`, which is the caller's own command.

use crate::error::{Phase, Result, RuntimeError};
use crate::process::Invocation;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Executable used when nothing else is configured.
pub const DEFAULT_EXECUTABLE: &str = "enroot";

/// Options for `enroot start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Mount the container root filesystem read-write (`--rw`).
    pub writable: bool,
    /// Remap the current user to root inside the container (`--root`).
    pub root: bool,
    /// Environment entries, emitted as `--env KEY=VALUE` in order.
    pub env: Vec<(String, String)>,
}

/// Handle on an enroot executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enroot {
    executable: PathBuf,
}

impl Default for Enroot {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTABLE)
    }
}

impl Enroot {
    /// Use the given executable (a bare name is looked up on `PATH`).
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Path or name of the executable.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn invocation(&self, phase: Phase, timeout: Duration) -> Invocation {
        Invocation::new(&self.executable, phase, timeout)
    }

    /// `enroot import -o <output> <image>`
    pub fn import(&self, image: &str, output: &Path, timeout: Duration) -> Invocation {
        self.invocation(Phase::Import, timeout)
            .arg("import")
            .arg("-o")
            .arg(output)
            .arg(image)
    }

    /// `enroot create -n <name> <artifact>`
    pub fn create(&self, name: &str, artifact: &Path, timeout: Duration) -> Invocation {
        self.invocation(Phase::Create, timeout)
            .args(["create", "-n", name])
            .arg(artifact)
    }

    /// `enroot start [--rw] [--root] [--env K=V]... <name> <program...>`
    pub fn start<I, S>(
        &self,
        name: &str,
        options: &StartOptions,
        program: I,
        timeout: Duration,
    ) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut args: Vec<OsString> = vec!["start".into()];
        if options.writable {
            args.push("--rw".into());
        }
        if options.root {
            args.push("--root".into());
        }
        for (key, value) in &options.env {
            args.push("--env".into());
            args.push(format!("{key}={value}").into());
        }
        args.push(name.into());
        args.extend(program.into_iter().map(Into::into));

        self.invocation(Phase::Exec, timeout).args(args)
    }

    /// `enroot remove -f <name>`
    pub fn remove(&self, name: &str, timeout: Duration) -> Invocation {
        self.invocation(Phase::Remove, timeout)
            .args(["remove", "-f", name])
    }

    /// `enroot list`
    pub fn list(&self, timeout: Duration) -> Invocation {
        self.invocation(Phase::List, timeout).arg("list")
    }

    /// Names of existing containers, optionally restricted to a prefix.
    pub async fn containers(&self, prefix: Option<&str>, timeout: Duration) -> Result<Vec<String>> {
        let output = self.list(timeout).run().await?;
        if !output.success() {
            return Err(RuntimeError::Exec {
                name: String::new(),
                reason: format!("enroot list failed: {}", output.diagnostic()),
            });
        }
        Ok(parse_list(&output.stdout, prefix))
    }

    /// Whether a container with this exact name exists.
    pub async fn exists(&self, name: &str, timeout: Duration) -> Result<bool> {
        let names = self.containers(Some(name), timeout).await?;
        Ok(names.iter().any(|n| n == name))
    }

    /// Whether `enroot version` runs successfully.
    pub async fn is_available(&self) -> bool {
        self.invocation(Phase::List, Duration::from_secs(5))
            .arg("version")
            .run()
            .await
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

fn parse_list(stdout: &str, prefix: Option<&str>) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| prefix.map_or(true, |p| line.starts_with(p)))
        .map(str::to_string)
        .collect()
}

/// Whether runtime output reports that a container does not exist.
pub(crate) fn reports_missing(output: &str) -> bool {
    output.contains("No such file or directory") || output.contains("does not exist")
}

/// Whether runtime output reports that the container `name` itself is taken.
///
/// Only a line naming the container counts; "File exists" from unpacking
/// the image into a freshly staged container is an ordinary failure.
pub(crate) fn reports_name_in_use(output: &str, name: &str) -> bool {
    let by_path = format!("/{name}");
    let by_name = format!(" {name}");
    output.lines().map(str::trim_end).any(|line| {
        (line.contains("already exists") || line.contains("File exists"))
            && (line.ends_with(&by_path) || line.ends_with(&by_name))
    })
}
