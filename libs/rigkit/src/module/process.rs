//! Production module backend: real child processes talking over Unix domain
//! sockets with the length-prefixed JSON protocol from `rigkit-wire`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use rigkit_wire::{ModuleRequest, ModuleResponse, WireResourceConfig, module_socket_path, read_frame, write_frame};

use crate::config::ResourceConfig;
use crate::errors::ResourceError;
use crate::module::backend::{ModuleBackend, ModuleProcess, ModuleSession, SpawnSpec, SpawnedModule};
use crate::name::{Model, ResourceName};
use crate::resource::{Dependencies, ReconfigureOutcome};

/// How long a module gets to bind its socket and answer the handshake.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request deadline on an established session.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for the module socket to appear.
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Spawns module binaries and connects to their sockets.
pub struct ProcessModuleBackend {
    socket_dir: PathBuf,
}

impl ProcessModuleBackend {
    #[must_use]
    pub fn new(socket_dir: Option<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.unwrap_or_else(std::env::temp_dir),
        }
    }
}

#[async_trait]
impl ModuleBackend for ProcessModuleBackend {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedModule, ResourceError> {
        let socket = module_socket_path(&self.socket_dir, &spec.module_name);
        let _ = std::fs::remove_file(&socket);

        let mut child = Command::new(&spec.exec_path)
            .arg("--socket")
            .arg(&socket)
            .envs(&spec.environment)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ResourceError::Transport(format!(
                    "failed to spawn module \"{}\" from {}: {e}",
                    spec.module_name,
                    spec.exec_path.display()
                ))
            })?;

        let stream = tokio::select! {
            stream = connect_with_retry(&socket) => stream?,
            _ = child.wait() => {
                return Err(ResourceError::Transport(format!(
                    "module \"{}\" exited during startup",
                    spec.module_name
                )));
            }
        };

        let session = UdsModuleSession::open(stream, &spec.module_name).await?;
        Ok(SpawnedModule {
            process: Box::new(ChildProcess { child }),
            session: Arc::new(session),
        })
    }
}

async fn connect_with_retry(socket: &std::path::Path) -> Result<UnixStream, ResourceError> {
    let attempt = async {
        loop {
            match UnixStream::connect(socket).await {
                Ok(stream) => return stream,
                Err(_) => tokio::time::sleep(CONNECT_RETRY).await,
            }
        }
    };
    tokio::time::timeout(STARTUP_TIMEOUT, attempt)
        .await
        .map_err(|_| {
            ResourceError::Transport(format!(
                "timed out waiting for module socket {}",
                socket.display()
            ))
        })
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ModuleProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) {
        let _ = self.child.wait().await;
    }

    async fn stop(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}

/// Client half of the module protocol over one Unix socket.
pub struct UdsModuleSession {
    module_name: String,
    io: tokio::sync::Mutex<UnixStream>,
    served: Vec<Model>,
}

impl UdsModuleSession {
    async fn open(mut stream: UnixStream, module_name: &str) -> Result<Self, ResourceError> {
        let exchange = async {
            write_frame(&mut stream, &ModuleRequest::Ready).await?;
            read_frame::<_, ModuleResponse>(&mut stream).await
        };
        let reply = tokio::time::timeout(STARTUP_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                ResourceError::Transport(format!(
                    "module \"{module_name}\" did not answer the handshake"
                ))
            })?
            .map_err(|e| transport(module_name, &e))?;

        let ModuleResponse::Ready { served_models } = reply else {
            return Err(ResourceError::Transport(format!(
                "module \"{module_name}\" sent an unexpected handshake reply"
            )));
        };
        let served = served_models
            .iter()
            .map(|m| m.parse())
            .collect::<Result<Vec<Model>, _>>()?;

        Ok(Self {
            module_name: module_name.to_owned(),
            io: tokio::sync::Mutex::new(stream),
            served,
        })
    }

    async fn request(&self, req: &ModuleRequest) -> Result<ModuleResponse, ResourceError> {
        let mut io = self.io.lock().await;
        let exchange = async {
            write_frame(&mut *io, req).await?;
            read_frame::<_, ModuleResponse>(&mut *io).await
        };
        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                ResourceError::Transport(format!(
                    "request to module \"{}\" timed out",
                    self.module_name
                ))
            })?
            .map_err(|e| transport(&self.module_name, &e))
    }
}

fn transport(module: &str, err: &rigkit_wire::FrameError) -> ResourceError {
    ResourceError::Transport(format!("session with module \"{module}\" failed: {err}"))
}

fn to_wire(config: &ResourceConfig, deps: &Dependencies) -> (WireResourceConfig, BTreeMap<String, String>) {
    let wire = WireResourceConfig {
        name: config.resource_name().to_string(),
        api: config.api.to_string(),
        model: config.model.to_string(),
        attributes: config.attributes.clone(),
        depends_on: deps.keys().map(ToString::to_string).collect(),
    };
    let dep_addrs = deps
        .keys()
        .map(|n| (n.to_string(), String::new()))
        .collect();
    (wire, dep_addrs)
}

#[async_trait]
impl ModuleSession for UdsModuleSession {
    fn served_models(&self) -> Vec<Model> {
        self.served.clone()
    }

    async fn validate(&self, config: &ResourceConfig) -> Result<Vec<String>, ResourceError> {
        let (wire, _) = to_wire(config, &Dependencies::new());
        match self.request(&ModuleRequest::Validate { config: wire }).await? {
            ModuleResponse::Validated { implicit_deps } => Ok(implicit_deps),
            ModuleResponse::Error { message } => Err(ResourceError::Validation(message)),
            _ => Err(self.unexpected("validate")),
        }
    }

    async fn add_resource(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<(), ResourceError> {
        let (wire, dep_addrs) = to_wire(config, deps);
        match self
            .request(&ModuleRequest::AddResource {
                config: wire,
                deps: dep_addrs,
            })
            .await?
        {
            ModuleResponse::Added => Ok(()),
            ModuleResponse::Error { message } => Err(ResourceError::Validation(message)),
            _ => Err(self.unexpected("add_resource")),
        }
    }

    async fn reconfigure_resource(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError> {
        let (wire, dep_addrs) = to_wire(config, deps);
        match self
            .request(&ModuleRequest::ReconfigureResource {
                config: wire,
                deps: dep_addrs,
            })
            .await?
        {
            ModuleResponse::Reconfigured { rebuild_required } => Ok(if rebuild_required {
                ReconfigureOutcome::NeedsRebuild
            } else {
                ReconfigureOutcome::Reconfigured
            }),
            ModuleResponse::Error { message } => Err(ResourceError::Validation(message)),
            _ => Err(self.unexpected("reconfigure_resource")),
        }
    }

    async fn remove_resource(&self, name: &ResourceName) -> Result<(), ResourceError> {
        match self
            .request(&ModuleRequest::RemoveResource {
                name: name.to_string(),
            })
            .await?
        {
            ModuleResponse::Removed => Ok(()),
            ModuleResponse::Error { message } => Err(ResourceError::Validation(message)),
            _ => Err(self.unexpected("remove_resource")),
        }
    }

    async fn do_command(
        &self,
        name: &ResourceName,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        match self
            .request(&ModuleRequest::DoCommand {
                name: name.to_string(),
                command,
            })
            .await?
        {
            ModuleResponse::CommandResult { result } => Ok(result),
            ModuleResponse::Error { message } => Err(ResourceError::Validation(message)),
            _ => Err(self.unexpected("do_command")),
        }
    }

    async fn shutdown(&self) -> Result<(), ResourceError> {
        match self.request(&ModuleRequest::Shutdown).await? {
            ModuleResponse::ShuttingDown => Ok(()),
            _ => Ok(()),
        }
    }
}

impl UdsModuleSession {
    fn unexpected(&self, op: &str) -> ResourceError {
        ResourceError::Transport(format!(
            "module \"{}\" sent an unexpected reply to {op}",
            self.module_name
        ))
    }
}
