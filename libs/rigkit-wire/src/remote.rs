//! Messages exchanged between a robot and one of its remotes.
//!
//! The mirror only needs two things from a remote: the set of resource names
//! it currently exposes, and a way to forward operator commands to one of
//! them. Authentication is a single entity/secret pair presented at session
//! open; the remote closes the connection on a bad secret.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteRequest {
    /// Session open. Must be the first message on a connection.
    Hello {
        #[serde(default)]
        entity: Option<String>,
        #[serde(default)]
        secret: Option<String>,
    },
    /// Fetch the remote's current fully qualified resource names.
    ResourceNames,
    /// Forward a command to a resource the remote owns.
    DoCommand {
        name: String,
        command: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteResponse {
    Hello,
    ResourceNames { names: Vec<String> },
    CommandResult { result: serde_json::Value },
    Error { message: String },
}
