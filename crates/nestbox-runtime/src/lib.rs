//! # nestbox-runtime
//!
//! Rootless container layer for nestbox, driving the enroot CLI.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nestbox_runtime::{Container, ContainerOptions, Enroot, ImageCache, ImageReference, StartOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> nestbox_runtime::Result<()> {
//! let enroot = Enroot::default();
//! let cache = ImageCache::new(ImageCache::default_root());
//! let image = ImageReference::new("docker://python:3.11-slim")?;
//!
//! // Import once; later calls hit the cache
//! let artifact = cache
//!     .ensure_imported(&enroot, &image, Duration::from_secs(300))
//!     .await?;
//!
//! let mut container = Container::create(
//!     &enroot,
//!     &artifact.path,
//!     ContainerOptions::default(),
//!     Duration::from_secs(120),
//! )
//! .await?;
//!
//! let output = enroot
//!     .start(container.name(), &StartOptions::default(), ["echo", "hi"], Duration::from_secs(30))
//!     .run()
//!     .await?;
//! assert_eq!(output.exit_code, 0);
//!
//! container.destroy(&enroot, Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Process Runner**: argv-only invocations with per-phase timeouts and
//!   process-group teardown
//! - **Image Cache**: import once per image reference, atomic publish
//! - **Container Lifecycle**: collision-free names, unwind on failed create,
//!   idempotent destroy

mod container;
mod enroot;
mod error;
mod image;
mod process;

pub use container::{
    generate_name, Container, ContainerOptions, ContainerState, CONTAINER_PREFIX,
};
pub use enroot::{Enroot, StartOptions, DEFAULT_EXECUTABLE};
pub use error::{Phase, Result, RuntimeError};
pub use image::{CachedImage, ImageCache, ImageReference, ARTIFACT_EXTENSION};
pub use process::{Invocation, ProcessOutput};
