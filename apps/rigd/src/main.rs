//! rigd — the robot daemon.
//!
//! Loads the declarative robot configuration, materializes it through the
//! rigkit resource manager, and keeps it alive: the completion worker heals
//! transient faults, the config watcher resubmits edits, and SIGINT/SIGTERM
//! tear the graph down in order.

mod bootstrap;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rigkit::builtin::register_builtins;
use rigkit::module::process::ProcessModuleBackend;
use rigkit::registry::RegistryBuilder;
use rigkit::remote::client::TcpRemoteDialer;
use rigkit::worker::spawn_completion_worker;
use rigkit::{ManagerOptions, ResourceManager};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "rigd", about = "Declarative robot resource runtime", version)]
struct Cli {
    /// Path to the robot configuration file (YAML).
    #[arg(long, short)]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,

    /// Do not run the background retry worker.
    #[arg(long)]
    no_completion_worker: bool,

    /// Do not watch the config file for changes.
    #[arg(long)]
    no_watch: bool,

    /// Retry cadence of the completion worker, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    completion_interval_ms: u64,

    /// Directory for module sockets (defaults to the system temp dir).
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    bootstrap::init_logging(cli.verbose);

    let config = bootstrap::load_config(&cli.config)?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    bootstrap::hook_signals(cancel.clone());

    let mut builder = RegistryBuilder::default();
    register_builtins(&mut builder);
    let registry = builder.build()?;

    let (manager, events) = ResourceManager::new(ManagerOptions {
        registry,
        module_backend: Arc::new(ProcessModuleBackend::new(cli.socket_dir.clone())),
        remote_dialer: Arc::new(TcpRemoteDialer),
        cancel: cancel.clone(),
    });

    info!(config = %cli.config.display(), "applying initial configuration");
    if let Err(e) = manager.reconfigure(config).await {
        // The manager keeps whatever it could build; the worker retries the
        // rest. Only the operator can fix a fatally bad config.
        error!(error = %e, "initial configuration failed");
    }

    let worker = if cli.no_completion_worker {
        drop(events);
        None
    } else {
        Some(spawn_completion_worker(
            Arc::clone(&manager),
            events,
            Duration::from_millis(cli.completion_interval_ms),
            cancel.child_token(),
        ))
    };

    if !cli.no_watch {
        tokio::spawn(bootstrap::watch_config(
            cli.config.clone(),
            Arc::clone(&manager),
            cancel.child_token(),
        ));
    }

    cancel.cancelled().await;
    info!("shutting down");

    if tokio::time::timeout(CLOSE_TIMEOUT, manager.close())
        .await
        .is_err()
    {
        warn!("resource manager did not close within the deadline");
    }
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    Ok(())
}
