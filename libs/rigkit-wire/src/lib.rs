//! Wire protocol shared between the rigkit host, out-of-process modules, and
//! remote robots.
//!
//! The host and its peers exchange length-prefixed JSON frames over Unix
//! domain sockets. This crate owns the message shapes and the framing; it
//! deliberately knows nothing about the resource graph so that module authors
//! can depend on it without pulling in the runtime.

mod frame;
mod module;
mod remote;
mod socket;

pub use frame::{FrameError, MAX_FRAME_LEN, read_frame, write_frame};
pub use module::{
    ModuleRequest, ModuleResponse, WireModel, WireResourceConfig, WireResourceName,
};
pub use remote::{RemoteRequest, RemoteResponse};
pub use socket::module_socket_path;
