//! The completion worker.
//!
//! A background task that ticks the engine's retry pass so transiently
//! broken resources recover without a user-initiated reconfigure, and that
//! consumes module lifecycle events to drive the post-restart re-add. It can
//! be left unspawned for deterministic tests; everything it does is also
//! reachable through the manager's public methods.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::manager::ResourceManager;
use crate::module::ModuleEvent;

/// Default retry cadence.
pub const DEFAULT_COMPLETION_INTERVAL: Duration = Duration::from_secs(1);

/// Cap on back-to-back retry rounds within one tick; if the graph is still
/// changing after this many, the next tick picks it up.
const MAX_IMMEDIATE_ROUNDS: usize = 3;

pub fn spawn_completion_worker(
    manager: Arc<ResourceManager>,
    mut events: mpsc::UnboundedReceiver<ModuleEvent>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut rounds = 0;
                    while manager.update_remotes_and_retry_resource_configure().await {
                        rounds += 1;
                        if rounds >= MAX_IMMEDIATE_ROUNDS {
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(ModuleEvent::Restarted { module }) => {
                            manager.handle_module_restarted(&module).await;
                            let _ = manager.update_remotes_and_retry_resource_configure().await;
                        }
                        Some(ModuleEvent::Crashed { module }) => {
                            tracing::debug!(module = %module, "module crash observed");
                        }
                        Some(ModuleEvent::StartFailed { module }) => {
                            tracing::debug!(module = %module, "module start failure observed");
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("completion worker stopped");
    })
}
