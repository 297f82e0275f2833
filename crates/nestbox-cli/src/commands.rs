//! Subcommand implementations.

use crate::args::RunArgs;
use anyhow::{bail, Context};
use nestbox_core::{Environment, ExecResult};
use nestbox_runtime::{Enroot, ImageCache};
use std::path::PathBuf;
use std::time::Duration;

/// Budget for listing and removing containers during a prune.
const PRUNE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run one command in a fresh environment and return its exit code.
pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let config = args.to_config()?;
    let command = args.command_line();
    tracing::debug!(image = %config.image, command = %command, "Running one-shot command");

    let result: ExecResult = Environment::scoped(config, |env| async move {
        env.execute(&command, None).await
    })
    .await?;

    if args.json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        print!("{}", result.output);
    }
    Ok(result.returncode)
}

/// Remove every container whose name starts with `prefix`.
pub async fn prune(enroot: &Enroot, prefix: &str, dry_run: bool) -> anyhow::Result<()> {
    if prefix.is_empty() {
        bail!("refusing to prune with an empty prefix");
    }

    let names = enroot
        .containers(Some(prefix), PRUNE_TIMEOUT)
        .await
        .context("failed to list containers")?;
    if names.is_empty() {
        tracing::info!(prefix = %prefix, "No containers to prune");
        return Ok(());
    }

    let mut failed = 0usize;
    for name in &names {
        if dry_run {
            println!("{name}");
            continue;
        }
        match enroot.remove(name, PRUNE_TIMEOUT).run().await {
            Ok(output) if output.success() => println!("removed {name}"),
            Ok(output) => {
                failed += 1;
                tracing::warn!(container = %name, reason = %output.diagnostic(), "Failed to remove container");
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(container = %name, error = %e, "Failed to remove container");
            }
        }
    }

    if failed > 0 {
        bail!("failed to remove {failed} of {} containers", names.len());
    }
    Ok(())
}

/// Print the contents of the image cache.
pub fn images(cache_dir: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let cache = ImageCache::new(cache_dir.unwrap_or_else(ImageCache::default_root));
    let images = cache
        .cached_images()
        .with_context(|| format!("failed to read cache at {}", cache.root().display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&images)?);
        return Ok(());
    }
    for image in &images {
        println!("{:>12}  {}", format_size(image.size), image.path.display());
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Map a command's return code onto a process exit status.
pub fn exit_status(returncode: i32) -> u8 {
    match returncode {
        0..=255 => returncode as u8,
        // Killed by a signal: shell convention 128 + signal.
        n if n < 0 && n > -128 => (128 - n) as u8,
        _ => 1,
    }
}
