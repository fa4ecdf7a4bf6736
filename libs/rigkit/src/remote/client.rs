//! Production remote dialer: the wire protocol over TCP.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use rigkit_wire::{RemoteRequest, RemoteResponse, read_frame, write_frame};

use crate::config::RemoteConfig;
use crate::errors::ResourceError;
use crate::name::ResourceName;
use crate::remote::{RemoteDialer, RemoteSession};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials remotes at `host:port` addresses.
#[derive(Debug, Default)]
pub struct TcpRemoteDialer;

#[async_trait]
impl RemoteDialer for TcpRemoteDialer {
    async fn dial(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteSession>, ResourceError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&config.address))
            .await
            .map_err(|_| {
                ResourceError::Transport(format!(
                    "dial to remote \"{}\" at {} timed out",
                    config.name, config.address
                ))
            })?
            .map_err(|e| {
                ResourceError::Transport(format!(
                    "dial to remote \"{}\" at {} failed: {e}",
                    config.name, config.address
                ))
            })?;

        let session = TcpRemoteSession {
            remote_name: config.name.clone(),
            io: tokio::sync::Mutex::new(stream),
        };
        let (entity, secret) = match &config.auth {
            Some(auth) => (auth.entity.clone(), auth.secret.clone()),
            None => (None, None),
        };
        match session.request(&RemoteRequest::Hello { entity, secret }).await? {
            RemoteResponse::Hello => {}
            RemoteResponse::Error { message } => {
                return Err(ResourceError::Transport(format!(
                    "remote \"{}\" rejected the session: {message}",
                    config.name
                )));
            }
            _ => {
                return Err(ResourceError::Transport(format!(
                    "remote \"{}\" sent an unexpected hello reply",
                    config.name
                )));
            }
        }
        Ok(Arc::new(session))
    }
}

struct TcpRemoteSession {
    remote_name: String,
    io: tokio::sync::Mutex<TcpStream>,
}

impl TcpRemoteSession {
    async fn request(&self, req: &RemoteRequest) -> Result<RemoteResponse, ResourceError> {
        let mut io = self.io.lock().await;
        let exchange = async {
            write_frame(&mut *io, req).await?;
            read_frame::<_, RemoteResponse>(&mut *io).await
        };
        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                ResourceError::Transport(format!(
                    "request to remote \"{}\" timed out",
                    self.remote_name
                ))
            })?
            .map_err(|e| {
                ResourceError::Transport(format!(
                    "session with remote \"{}\" failed: {e}",
                    self.remote_name
                ))
            })
    }
}

#[async_trait]
impl RemoteSession for TcpRemoteSession {
    async fn resource_names(&self) -> Result<Vec<ResourceName>, ResourceError> {
        match self.request(&RemoteRequest::ResourceNames).await? {
            RemoteResponse::ResourceNames { names } => names
                .iter()
                .map(|n| n.parse())
                .collect::<Result<Vec<ResourceName>, _>>(),
            RemoteResponse::Error { message } => Err(ResourceError::Transport(message)),
            _ => Err(ResourceError::Transport(format!(
                "remote \"{}\" sent an unexpected reply to resource_names",
                self.remote_name
            ))),
        }
    }

    async fn do_command(
        &self,
        name: &ResourceName,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        match self
            .request(&RemoteRequest::DoCommand {
                name: name.to_string(),
                command,
            })
            .await?
        {
            RemoteResponse::CommandResult { result } => Ok(result),
            RemoteResponse::Error { message } => Err(ResourceError::Transport(message)),
            _ => Err(ResourceError::Transport(format!(
                "remote \"{}\" sent an unexpected reply to do_command",
                self.remote_name
            ))),
        }
    }

    async fn close(&self) {
        // Dropping the TCP stream is the close; nothing to negotiate.
    }
}
