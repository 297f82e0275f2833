//! nestbox entry point.
//!
//! ## Subcommands
//!
//! - **run**: create an environment, run one command, clean up
//! - **prune**: remove containers left behind by crashed processes
//! - **images**: list the image cache

mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use nestbox_runtime::Enroot;
use std::io::Write;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("nestbox=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let returncode = commands::run(args).await?;
            std::io::stdout().flush()?;
            Ok(ExitCode::from(commands::exit_status(returncode)))
        }
        Commands::Prune {
            prefix,
            dry_run,
            executable,
        } => {
            commands::prune(&Enroot::new(executable), &prefix, dry_run).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Images { cache_dir, json } => {
            commands::images(cache_dir, json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
