//! The remote mirror.
//!
//! For each configured remote the mirror keeps one session record. A
//! reconcile tick ([`RemoteMirror::sync`]) dials remotes that are down,
//! fetches the resource-name set of every remote that is up, and reports
//! snapshots for the engine to fold into the graph. Mirrored handles hold
//! only weak references to the session, so dropping a remote invalidates them
//! without dangling.

pub mod client;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use crate::config::RemoteConfig;
use crate::errors::ResourceError;
use crate::name::{Api, ResourceName};
use crate::resource::Resource;

/// Session state of one remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSessionState {
    Dialing,
    Up,
    Down,
}

#[async_trait]
pub trait RemoteDialer: Send + Sync {
    /// Open a session to the remote.
    ///
    /// # Errors
    /// `Transport` when the remote is unreachable or rejects the credentials.
    async fn dial(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteSession>, ResourceError>;
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// The remote's current fully qualified resource names, as the remote
    /// itself scopes them.
    ///
    /// # Errors
    /// `Transport` on a broken session; the mirror marks the remote down.
    async fn resource_names(&self) -> Result<Vec<ResourceName>, ResourceError>;

    /// Forward an operator command to a resource the remote owns.
    ///
    /// # Errors
    /// `Transport` on a broken session.
    async fn do_command(
        &self,
        name: &ResourceName,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError>;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// The graph node name that stands in for the remote itself. Every mirror
/// node holds an edge onto its remote's sentinel so that dropping the remote
/// tears down exactly its mirrors and their dependents.
#[must_use]
pub fn remote_sentinel_name(remote: &str) -> ResourceName {
    ResourceName::new(Api::new(crate::name::DEFAULT_NAMESPACE, "remote", "robot"), remote)
}

/// One reconcile-tick observation of one remote.
pub struct RemoteSnapshot {
    pub remote: String,
    pub reachable: bool,
    /// Mirrored (prefixed, remote-pathed) names with ready-to-attach handles.
    pub resources: Vec<(ResourceName, Arc<dyn Resource>)>,
}

struct RemoteRecord {
    config: RemoteConfig,
    state: RemoteSessionState,
    session: Option<Arc<dyn RemoteSession>>,
    last_known_resource_names: Vec<ResourceName>,
}

pub struct RemoteMirror {
    dialer: Arc<dyn RemoteDialer>,
    records: Mutex<BTreeMap<String, RemoteRecord>>,
}

impl RemoteMirror {
    #[must_use]
    pub fn new(dialer: Arc<dyn RemoteDialer>) -> Self {
        Self {
            dialer,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add a remote or absorb a config change. Any change drops the session;
    /// the next reconcile tick redials.
    pub fn upsert(&self, config: &RemoteConfig) {
        let mut records = self.records.lock();
        match records.get_mut(&config.name) {
            Some(rec) if rec.config == *config => {}
            Some(rec) => {
                tracing::info!(remote = %config.name, "remote config changed; session will be redialed");
                rec.config = config.clone();
                rec.session = None;
                rec.state = RemoteSessionState::Dialing;
            }
            None => {
                records.insert(
                    config.name.clone(),
                    RemoteRecord {
                        config: config.clone(),
                        state: RemoteSessionState::Dialing,
                        session: None,
                        last_known_resource_names: Vec::new(),
                    },
                );
            }
        }
    }

    /// Drop a remote and close its session.
    pub async fn remove(&self, remote: &str) {
        let rec = self.records.lock().remove(remote);
        if let Some(rec) = rec
            && let Some(session) = rec.session
        {
            session.close().await;
        }
    }

    #[must_use]
    pub fn session_state(&self, remote: &str) -> Option<RemoteSessionState> {
        self.records.lock().get(remote).map(|r| r.state)
    }

    /// The mirrored names observed in the remote's last successful poll.
    #[must_use]
    pub fn last_known_resource_names(&self, remote: &str) -> Vec<ResourceName> {
        self.records
            .lock()
            .get(remote)
            .map(|r| r.last_known_resource_names.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn remote_names(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    /// One reconcile tick: dial what is down, poll what is up, and report a
    /// snapshot per remote. Never holds the record lock across i/o.
    pub async fn sync(&self) -> Vec<RemoteSnapshot> {
        let targets: Vec<(String, RemoteConfig, Option<Arc<dyn RemoteSession>>)> = {
            let records = self.records.lock();
            records
                .values()
                .map(|rec| (rec.config.name.clone(), rec.config.clone(), rec.session.clone()))
                .collect()
        };

        let mut snapshots = Vec::with_capacity(targets.len());
        for (remote, config, session) in targets {
            let session = match session {
                Some(session) => session,
                None => match self.dialer.dial(&config).await {
                    Ok(session) => {
                        tracing::info!(remote = %remote, address = %config.address, "remote session established");
                        let mut records = self.records.lock();
                        if let Some(rec) = records.get_mut(&remote) {
                            rec.session = Some(Arc::clone(&session));
                            rec.state = RemoteSessionState::Up;
                        }
                        session
                    }
                    Err(e) => {
                        tracing::debug!(remote = %remote, error = %e, "remote dial failed; will retry");
                        self.set_state(&remote, RemoteSessionState::Dialing);
                        snapshots.push(RemoteSnapshot {
                            remote,
                            reachable: false,
                            resources: Vec::new(),
                        });
                        continue;
                    }
                },
            };

            match session.resource_names().await {
                Ok(names) => {
                    let prefix = config.prefix.as_deref();
                    let resources: Vec<(ResourceName, Arc<dyn Resource>)> = names
                        .iter()
                        .map(|original| {
                            let mirrored = original.mirrored_through(&remote, prefix);
                            let handle: Arc<dyn Resource> = Arc::new(MirrorResourceHandle {
                                remote_scoped_name: original.clone(),
                                session: Arc::downgrade(&session),
                            });
                            (mirrored, handle)
                        })
                        .collect();
                    {
                        let mut records = self.records.lock();
                        if let Some(rec) = records.get_mut(&remote) {
                            rec.state = RemoteSessionState::Up;
                            rec.last_known_resource_names =
                                resources.iter().map(|(n, _)| n.clone()).collect();
                        }
                    }
                    snapshots.push(RemoteSnapshot {
                        remote,
                        reachable: true,
                        resources,
                    });
                }
                Err(e) => {
                    tracing::warn!(remote = %remote, error = %e, "remote session lost");
                    {
                        let mut records = self.records.lock();
                        if let Some(rec) = records.get_mut(&remote) {
                            rec.session = None;
                            rec.state = RemoteSessionState::Down;
                        }
                    }
                    snapshots.push(RemoteSnapshot {
                        remote,
                        reachable: false,
                        resources: Vec::new(),
                    });
                }
            }
        }
        snapshots
    }

    /// Close every session. Used on runtime shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<dyn RemoteSession>> = {
            let mut records = self.records.lock();
            let drained: Vec<RemoteRecord> = std::mem::take(&mut *records).into_values().collect();
            drained.into_iter().filter_map(|r| r.session).collect()
        };
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
    }

    /// Remotes configured but absent from `keep`: used by the engine when a
    /// new config drops remotes.
    #[must_use]
    pub fn stale_remotes(&self, keep: &BTreeSet<String>) -> Vec<String> {
        self.records
            .lock()
            .keys()
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect()
    }

    fn set_state(&self, remote: &str, state: RemoteSessionState) {
        if let Some(rec) = self.records.lock().get_mut(remote) {
            rec.state = state;
        }
    }
}

/// Handle attached to a mirror node. Holds the name as the remote scopes it
/// (no prefix, no local remote-path segment) and a weak session reference.
struct MirrorResourceHandle {
    remote_scoped_name: ResourceName,
    session: Weak<dyn RemoteSession>,
}

#[async_trait]
impl Resource for MirrorResourceHandle {
    async fn do_command(
        &self,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        let session = self.session.upgrade().ok_or_else(|| {
            ResourceError::Transport(format!(
                "remote session for \"{}\" is closed",
                self.remote_scoped_name
            ))
        })?;
        session.do_command(&self.remote_scoped_name, command).await
    }
}
