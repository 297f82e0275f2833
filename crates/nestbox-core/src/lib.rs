//! # nestbox-core
//!
//! Command execution environments for coding agents.
//!
//! An [`Environment`] owns one rootless enroot container created from a
//! cached image. Each command runs in a fresh shell inside that container,
//! so filesystem changes persist between commands while working directory
//! and shell state do not.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   nestbox-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  Environment    │────▶│  CommandExecutor         │   │
//! │  │   - new()       │     │   cd <cwd> && <command>  │   │
//! │  │   - execute()   │     │   env merge, timeout     │   │
//! │  │   - cleanup()   │     └──────────────────────────┘   │
//! │  └─────────────────┘                │                   │
//! │           │                         ▼                   │
//! │           │              ┌──────────────────────────┐   │
//! │           └─────────────▶│  nestbox-runtime         │   │
//! │                          │  ImageCache, Container   │   │
//! │                          └──────────────────────────┘   │
//! │                                     │ argv              │
//! └─────────────────────────────────────┼────────────────────┘
//!                                       ▼
//!                          enroot import / create / start / remove
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use nestbox_core::{Environment, EnvironmentConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> nestbox_core::Result<()> {
//! let config = EnvironmentConfig::builder()
//!     .image("docker://python:3.11-slim")
//!     .cwd("/tmp")
//!     .env("PAGER", "cat")
//!     .forward_env("HF_TOKEN")
//!     .timeout(Duration::from_secs(60))
//!     .build()?;
//!
//! let env = Environment::new(config).await?;
//!
//! let result = env.execute("python --version", None).await?;
//! println!("{} (exit {})", result.output, result.returncode);
//!
//! // Working directory applies to this call only
//! let result = env.execute("ls", Some("/etc")).await?;
//! assert_eq!(result.returncode, 0);
//!
//! let report = env.cleanup().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Shared Image Cache**: images are imported once and reused
//! - **Stateless Commands**: per-call working directory and environment
//! - **Timeouts**: every phase is bounded, and timed-out commands are killed
//! - **Guaranteed Cleanup**: idempotent cleanup, scoped helper, drop safety net

mod config;
mod environment;
mod error;
mod exec;

pub use config::{EnvironmentConfig, EnvironmentConfigBuilder, ImageStore, EXECUTABLE_ENV_VAR};
pub use environment::{CleanupReport, Environment, EnvironmentState};
pub use error::{CoreError, ErrorKind, Result};
pub use exec::{CommandExecutor, ExecRequest, ExecResult};

pub use nestbox_runtime::{Phase, RuntimeError};
