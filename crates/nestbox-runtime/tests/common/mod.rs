//! Scripted enroot stand-in shared by the integration tests of every
//! workspace crate (pulled in elsewhere with `#[path]`).

#![allow(dead_code)]

use nestbox_runtime::Enroot;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;

const SCRIPT: &str = include_str!("../fixtures/fake-enroot.sh");

/// Install the fake runtime once per test binary.
///
/// Writing an executable while other test threads fork can make the first
/// exec fail with ETXTBSY, so installation waits until the script runs.
fn shared_script() -> &'static Path {
    static INSTALLED: OnceLock<TempDir> = OnceLock::new();
    INSTALLED
        .get_or_init(|| {
            let dir = TempDir::new().expect("create script dir");
            let path = dir.path().join("fake-enroot");
            fs::write(&path, SCRIPT).expect("write fake enroot");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("chmod fake enroot");
            for _ in 0..100 {
                match std::process::Command::new(&path).arg("version").output() {
                    Ok(out) if out.status.success() => break,
                    _ => std::thread::sleep(Duration::from_millis(20)),
                }
            }
            dir
        })
        .path()
}

/// A private fake enroot: a symlink to the shared script plus its state.
pub struct FakeEnroot {
    dir: TempDir,
    executable: PathBuf,
}

impl FakeEnroot {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create fake runtime dir");
        let executable = dir.path().join("enroot");
        symlink(shared_script().join("fake-enroot"), &executable).expect("link fake enroot");
        Self { dir, executable }
    }

    /// Private directory holding the runtime's state.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn enroot(&self) -> Enroot {
        Enroot::new(&self.executable)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Names of containers currently known to the fake runtime.
    pub fn containers(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.dir.path().join("data/containers")) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Image references passed to `import`, in order.
    pub fn imports(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("data/imports.log"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Flags recorded by the last `start` of a container.
    pub fn last_start(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.dir.path().join(format!("data/containers/{name}.last-start")))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Remove a container behind its owner's back.
    pub fn remove_externally(&self, name: &str) {
        let status = std::process::Command::new(&self.executable)
            .args(["remove", "-f", name])
            .status()
            .expect("run fake remove");
        assert!(status.success());
    }
}
