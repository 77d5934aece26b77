use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// level, otherwise `info` (or `debug`). With a `log_dir` the output goes
/// to a file `monitor<date>` in that folder.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(debug: bool, log_dir: Option<&Path>) -> Result<bool> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(debug);

    let installed = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create log folder {}", dir.display()))?;
            let path = dir.join(format!("monitor{}", Utc::now().format("%Y-%m-%d-%H:%M")));
            let file = File::create(&path).with_context(|| format!("Failed to create log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init().is_ok()
        }
        None => builder.try_init().is_ok(),
    };
    Ok(installed)
}
