//! Managed child programs.
//!
//! Processes are plain children, not modules: no socket, no session, no
//! served models. They are diffed like every other config list and restarted
//! on exit with the same bounded backoff the module supervisor uses, unless
//! declared one-shot.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessConfig;
use crate::errors::ResourceError;

const RESTART_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(5);

struct ProcRecord {
    config: ProcessConfig,
    cancel: CancellationToken,
    pid: Arc<Mutex<Option<u32>>>,
}

pub struct ProcessManager {
    records: Mutex<BTreeMap<String, ProcRecord>>,
    cancel: CancellationToken,
}

impl ProcessManager {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            cancel,
        }
    }

    /// Start a process if absent, restart it if its config changed.
    ///
    /// # Errors
    /// `Transport` when the initial spawn fails. Later exits are handled by
    /// the monitor task, not surfaced here.
    pub fn upsert(&self, config: &ProcessConfig) -> Result<(), ResourceError> {
        {
            let mut records = self.records.lock();
            match records.get(&config.id) {
                Some(rec) if rec.config == *config => return Ok(()),
                Some(rec) => {
                    tracing::info!(process = %config.id, "process config changed; restarting");
                    rec.cancel.cancel();
                    records.remove(&config.id);
                }
                None => {}
            }
        }

        let child = spawn_child(config)?;
        let pid = Arc::new(Mutex::new(child.id()));
        let cancel = self.cancel.child_token();
        tracing::info!(process = %config.id, pid = ?child.id(), "process started");

        self.records.lock().insert(
            config.id.clone(),
            ProcRecord {
                config: config.clone(),
                cancel: cancel.clone(),
                pid: Arc::clone(&pid),
            },
        );
        tokio::spawn(monitor_process(config.clone(), child, pid, cancel));
        Ok(())
    }

    /// Stop and drop a process. Idempotent.
    pub fn remove(&self, id: &str) {
        if let Some(rec) = self.records.lock().remove(id) {
            tracing::info!(process = %id, "stopping process");
            rec.cancel.cancel();
        }
    }

    #[must_use]
    pub fn managed_ids(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn pid(&self, id: &str) -> Option<u32> {
        self.records.lock().get(id).and_then(|r| *r.pid.lock())
    }

    /// Processes not in `keep`; the engine removes these on reconfigure.
    #[must_use]
    pub fn stale_ids(&self, keep: &std::collections::BTreeSet<String>) -> Vec<String> {
        self.records
            .lock()
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect()
    }

    pub fn shutdown_all(&self) {
        let mut records = self.records.lock();
        for (_, rec) in std::mem::take(&mut *records) {
            rec.cancel.cancel();
        }
    }
}

fn spawn_child(config: &ProcessConfig) -> Result<tokio::process::Child, ResourceError> {
    let mut cmd = Command::new(&config.exec_path);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }
    cmd.spawn().map_err(|e| {
        ResourceError::Transport(format!(
            "failed to spawn process \"{}\" from {}: {e}",
            config.id,
            config.exec_path.display()
        ))
    })
}

async fn monitor_process(
    config: ProcessConfig,
    mut child: tokio::process::Child,
    pid: Arc<Mutex<Option<u32>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                *pid.lock() = None;
                return;
            }
            status = child.wait() => {
                *pid.lock() = None;
                if config.one_shot {
                    tracing::info!(process = %config.id, status = ?status.ok(), "one-shot process finished");
                    return;
                }
                if !config.restart_on_exit {
                    tracing::warn!(process = %config.id, status = ?status.ok(), "process exited; restart disabled");
                    return;
                }
                tracing::warn!(process = %config.id, status = ?status.ok(), "process exited; restarting");
            }
        }

        let mut backoff = RESTART_BACKOFF_MIN;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }
            match spawn_child(&config) {
                Ok(new_child) => {
                    *pid.lock() = new_child.id();
                    tracing::info!(process = %config.id, pid = ?new_child.id(), "process restarted");
                    child = new_child;
                    break;
                }
                Err(e) => {
                    tracing::error!(process = %config.id, error = %e, "process restart failed");
                    backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_shot_process_runs_and_is_not_restarted() {
        let manager = ProcessManager::new(CancellationToken::new());
        let mut config = ProcessConfig::new("true", "/bin/true");
        config.one_shot = true;
        manager.upsert(&config).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.pid("true"), None);
        assert_eq!(manager.managed_ids(), vec!["true".to_owned()]);
    }

    #[tokio::test]
    async fn bad_exec_path_is_an_error() {
        let manager = ProcessManager::new(CancellationToken::new());
        let config = ProcessConfig::new("ghost", "/nonexistent/path/to/program");
        assert!(manager.upsert(&config).is_err());
        assert!(manager.managed_ids().is_empty());
    }

    #[tokio::test]
    async fn remove_kills_the_child() {
        let manager = ProcessManager::new(CancellationToken::new());
        let config = ProcessConfig::new("sleeper", "/bin/sleep");
        let config = ProcessConfig {
            args: vec!["30".to_owned()],
            ..config
        };
        manager.upsert(&config).unwrap();
        assert!(manager.pid("sleeper").is_some());
        manager.remove("sleeper");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.managed_ids().is_empty());
    }

    #[tokio::test]
    async fn unchanged_config_is_a_noop() {
        let manager = ProcessManager::new(CancellationToken::new());
        let mut config = ProcessConfig::new("sleeper", "/bin/sleep");
        config.args = vec!["30".to_owned()];
        manager.upsert(&config).unwrap();
        let first_pid = manager.pid("sleeper");
        manager.upsert(&config).unwrap();
        assert_eq!(manager.pid("sleeper"), first_pid);
        manager.shutdown_all();
    }
}
