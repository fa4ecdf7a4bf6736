//! Daemon bootstrap: logging, config loading, signals, config watching.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rigkit::{Config, ResourceManager};

/// Initialize tracing. `RIGD_LOG` overrides the verbosity flags.
pub fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("RIGD_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!("rigd={default_level},rigkit={default_level}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load and parse the YAML robot configuration.
///
/// # Errors
/// I/o and parse failures, with the offending path attached.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_saphyr::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Cancel the root token on SIGINT or SIGTERM.
pub fn hook_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler; falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Poll the config file's mtime and resubmit it on change.
pub async fn watch_config(
    path: PathBuf,
    manager: Arc<ResourceManager>,
    cancel: CancellationToken,
) {
    const POLL: Duration = Duration::from_secs(2);
    let mut last_mtime = mtime_of(&path);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(POLL) => {}
        }
        let mtime = mtime_of(&path);
        if mtime == last_mtime {
            continue;
        }
        last_mtime = mtime;
        info!(config = %path.display(), "configuration file changed; reconfiguring");
        match load_config(&path) {
            Ok(config) => {
                if let Err(e) = manager.reconfigure(config).await {
                    warn!(error = %e, "reconfigure from watched config failed");
                }
            }
            Err(e) => warn!(error = %e, "ignoring unparsable config change"),
        }
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
