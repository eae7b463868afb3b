//! Running one submission inside one container.
//!
//! The container entrypoint reports its progress by printing milestone
//! tokens on stdout; nothing else it prints is trusted or interpreted.

mod protocol;
mod runner;
mod runtime;

pub use protocol::{Handshake, Milestone, ProtocolState};
pub use runner::{COMPILE_ERROR_SIGNAL, Sandbox};
pub use runtime::{Container, ContainerRuntime, DockerCli};
