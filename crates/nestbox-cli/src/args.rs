//! Command-line arguments.
//!
//! Every flag that shapes an environment can also come from a `NESTBOX_*`
//! environment variable.

use clap::{Args, Parser, Subcommand};
use nestbox_core::{CoreError, EnvironmentConfig, EXECUTABLE_ENV_VAR};
use nestbox_runtime::CONTAINER_PREFIX;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "nestbox")]
#[command(author, version, about = "Run commands in rootless enroot containers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create an environment, run one command, clean up
    Run(RunArgs),

    /// Remove leftover containers by name prefix
    Prune {
        /// Only containers whose name starts with this prefix
        #[arg(long, default_value = CONTAINER_PREFIX)]
        prefix: String,

        /// List what would be removed without removing it
        #[arg(long)]
        dry_run: bool,

        /// enroot executable
        #[arg(long, env = EXECUTABLE_ENV_VAR, default_value = "enroot")]
        executable: PathBuf,
    },

    /// List cached images
    Images {
        /// Image cache directory
        #[arg(long, env = "NESTBOX_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Source image, e.g. docker://python:3.11-slim
    #[arg(short, long, env = "NESTBOX_IMAGE")]
    pub image: String,

    /// Working directory inside the container
    #[arg(long, default_value = "/")]
    pub cwd: String,

    /// Environment variable for the command (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Host variable to forward when set (repeatable)
    #[arg(long, value_name = "NAME")]
    pub forward_env: Vec<String>,

    /// Command timeout in seconds
    #[arg(short, long, default_value = "30", value_parser = parse_secs)]
    pub timeout: Duration,

    /// Image import timeout in seconds
    #[arg(long, default_value = "300", value_parser = parse_secs)]
    pub import_timeout: Duration,

    /// Container creation timeout in seconds
    #[arg(long, default_value = "120", value_parser = parse_secs)]
    pub create_timeout: Duration,

    /// Mount the container root filesystem read-only
    #[arg(long)]
    pub read_only: bool,

    /// Run as root inside the container
    #[arg(long)]
    pub root: bool,

    /// Shell that interprets the command
    #[arg(long, default_value = "bash")]
    pub shell: String,

    /// enroot executable
    #[arg(long, env = EXECUTABLE_ENV_VAR)]
    pub executable: Option<PathBuf>,

    /// Image cache directory
    #[arg(long, env = "NESTBOX_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Import into a temporary store removed afterwards (overrides --cache-dir)
    #[arg(long)]
    pub ephemeral: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Environment configuration described by these arguments.
    pub fn to_config(&self) -> Result<EnvironmentConfig, CoreError> {
        let mut builder = EnvironmentConfig::builder()
            .image(&self.image)
            .cwd(&self.cwd)
            .envs(self.env.iter().cloned())
            .timeout(self.timeout)
            .import_timeout(self.import_timeout)
            .create_timeout(self.create_timeout)
            .writable(!self.read_only)
            .root(self.root)
            .shell(&self.shell);
        for name in &self.forward_env {
            builder = builder.forward_env(name);
        }
        if let Some(path) = &self.executable {
            builder = builder.executable(path);
        }
        if let Some(dir) = &self.cache_dir {
            builder = builder.cache_dir(dir);
        }
        if self.ephemeral {
            builder = builder.ephemeral_images();
        }
        builder.build()
    }

    /// The command line as one shell string.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("invalid seconds '{s}': {e}"))?;
    if secs <= 0.0 {
        return Err("must be greater than 0".into());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}
