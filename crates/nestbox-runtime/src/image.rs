//! # Image Cache
//!
//! Imported images are squashfs artifacts produced by `enroot import`. They
//! are expensive to build (minutes for large images) and reusable by any
//! number of containers, so they are cached on disk by image reference.
//!
//! ## Layout
//!
//! ```text
//! ~/.cache/nestbox/images/
//! ├── docker___python_3.11-slim-3f2a9c01d4e5b677.sqsh
//! └── docker___ubuntu_22.04-91be004a7c3d2e10.sqsh.tmp-<uuid>.sqsh   (in flight)
//! ```
//!
//! The cache key is a readable prefix of the reference plus a SHA-256
//! fragment, so distinct references never share a file even when they
//! sanitize to the same prefix.
//!
//! ## Atomic Publish
//!
//! Imports write to a uniquely named temp file next to the final path and
//! `rename` it into place once complete. A concurrent reader sees either no
//! artifact or a complete one. Two concurrent importers of the same image
//! both succeed; the last rename wins and the content is equivalent.
//!
//! Temp files are removed on every failure path.

use crate::enroot::Enroot;
use crate::error::{Result, RuntimeError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// File extension of imported artifacts.
pub const ARTIFACT_EXTENSION: &str = "sqsh";

/// Maximum length of the human-readable part of a cache key.
const KEY_PREFIX_LEN: usize = 48;

/// Number of hex characters of the reference digest kept in a cache key.
const KEY_DIGEST_LEN: usize = 16;

/// Identifier of a source image, e.g. `docker://python:3.11-slim`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference(String);

impl ImageReference {
    /// Validate and wrap an image reference.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidImage`] for empty references and
    /// references containing whitespace or NUL bytes.
    pub fn new(reference: impl Into<String>) -> Result<Self> {
        let reference = reference.into();
        let reason = if reference.is_empty() {
            Some("reference is empty")
        } else if reference.chars().any(char::is_whitespace) {
            Some("reference contains whitespace")
        } else if reference.contains('\0') {
            Some("reference contains a NUL byte")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(RuntimeError::InvalidImage {
                reference,
                reason: reason.into(),
            }),
            None => Ok(Self(reference)),
        }
    }

    /// The reference string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic on-disk key for this reference.
    pub fn cache_key(&self) -> String {
        let readable: String = self
            .0
            .chars()
            .take(KEY_PREFIX_LEN)
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = hex::encode(Sha256::digest(self.0.as_bytes()));
        format!("{}-{}", readable, &digest[..KEY_DIGEST_LEN])
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A complete imported artifact in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedImage {
    /// Cache key the artifact is stored under.
    pub key: String,
    /// Path of the artifact.
    pub path: PathBuf,
    /// Artifact size in bytes.
    pub size: u64,
}

/// On-disk cache of imported images.
///
/// The cache never deletes artifacts on its own; eviction is left to the
/// operator (see [`ImageCache::remove`]).
#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    /// Cache rooted at `root`. The directory is created on first import.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default cache location.
    ///
    /// `$XDG_CACHE_HOME/nestbox/images`, then `$HOME/.cache/nestbox/images`,
    /// then `<tmp>/nestbox/images`.
    pub fn default_root() -> PathBuf {
        let base = std::env::var_os("XDG_CACHE_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .filter(|v| !v.is_empty())
                    .map(|home| PathBuf::from(home).join(".cache"))
            })
            .unwrap_or_else(std::env::temp_dir);
        base.join("nestbox").join("images")
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical artifact path for an image.
    pub fn artifact_path(&self, image: &ImageReference) -> PathBuf {
        self.root
            .join(format!("{}.{}", image.cache_key(), ARTIFACT_EXTENSION))
    }

    /// The cached artifact for an image, if it has been imported.
    pub fn lookup(&self, image: &ImageReference) -> Option<CachedImage> {
        let path = self.artifact_path(image);
        let meta = fs::metadata(&path).ok()?;
        meta.is_file().then(|| CachedImage {
            key: image.cache_key(),
            path,
            size: meta.len(),
        })
    }

    /// Return the artifact for `image`, importing it on a cache miss.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Import`] if the runtime rejects the image.
    /// - [`RuntimeError::Timeout`] if the import exceeds `timeout`.
    /// - [`RuntimeError::Launch`] if the runtime executable is missing.
    ///
    /// Imports are never retried here.
    pub async fn ensure_imported(
        &self,
        enroot: &Enroot,
        image: &ImageReference,
        timeout: Duration,
    ) -> Result<CachedImage> {
        if let Some(hit) = self.lookup(image) {
            tracing::debug!(image = %image, path = %hit.path.display(), "Image cache hit");
            return Ok(hit);
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let target = self.artifact_path(image);
        let partial = PartialArtifact::new(&target);
        let start = Instant::now();
        tracing::info!(
            image = %image,
            path = %target.display(),
            "Importing image"
        );

        let output = enroot
            .import(image.as_str(), partial.path(), timeout)
            .run()
            .await?;
        if !output.success() {
            tracing::error!(
                image = %image,
                exit_code = output.exit_code,
                stdout = %output.stdout.trim(),
                stderr = %output.stderr.trim(),
                "Image import failed"
            );
            return Err(RuntimeError::Import {
                image: image.to_string(),
                reason: output.diagnostic(),
            });
        }
        if !partial.path().is_file() {
            return Err(RuntimeError::Import {
                image: image.to_string(),
                reason: "runtime reported success but produced no artifact".into(),
            });
        }

        partial.publish()?;
        let cached = self.lookup(image).ok_or_else(|| RuntimeError::Import {
            image: image.to_string(),
            reason: "artifact vanished after publish".into(),
        })?;
        tracing::info!(
            image = %image,
            size = cached.size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image imported"
        );
        Ok(cached)
    }

    /// All complete artifacts in the cache.
    pub fn cached_images(&self) -> Result<Vec<CachedImage>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key) = name.strip_suffix(&format!(".{ARTIFACT_EXTENSION}")) else {
                continue;
            };
            if is_partial(key) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_file() {
                images.push(CachedImage {
                    key: key.to_string(),
                    path: path.clone(),
                    size: meta.len(),
                });
            }
        }
        images.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(images)
    }

    /// Delete the cached artifact for `image`. Missing artifacts are ignored.
    pub fn remove(&self, image: &ImageReference) -> Result<bool> {
        match fs::remove_file(self.artifact_path(image)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `key` (a file name minus its extension) is an in-flight import,
/// i.e. `<key>.sqsh.tmp-<32 hex digits>`.
fn is_partial(key: &str) -> bool {
    const SUFFIX_LEN: usize = 32;

    let Some((head, tail)) = key.rsplit_once(".tmp-") else {
        return false;
    };
    head.ends_with(&format!(".{ARTIFACT_EXTENSION}"))
        && tail.len() == SUFFIX_LEN
        && tail.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Temp artifact that is deleted unless published.
struct PartialArtifact {
    temp: PathBuf,
    target: PathBuf,
    published: bool,
}

impl PartialArtifact {
    fn new(target: &Path) -> Self {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp-{}.{}", uuid::Uuid::new_v4().simple(), ARTIFACT_EXTENSION));
        Self {
            temp: target.with_file_name(name),
            target: target.to_path_buf(),
            published: false,
        }
    }

    fn path(&self) -> &Path {
        &self.temp
    }

    fn publish(mut self) -> Result<()> {
        fs::rename(&self.temp, &self.target)?;
        self.published = true;
        Ok(())
    }
}

impl Drop for PartialArtifact {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        match fs::remove_file(&self.temp) {
            Ok(()) => tracing::debug!(path = %self.temp.display(), "Removed partial artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.temp.display(),
                error = %e,
                "Failed to remove partial artifact"
            ),
        }
    }
}
