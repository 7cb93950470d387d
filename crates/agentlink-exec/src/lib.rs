//! Remote command execution
//!
//! Runs commands on agent shell sessions, either synchronously or as
//! trackable background jobs whose output, state and stdin are reachable by
//! job id.

pub mod executor;
pub mod job;

use agentlink_transport::TransportError;
use thiserror::Error;
use uuid::Uuid;

pub use executor::{CommandExecutor, RunOutput};
pub use job::{CommandJob, OutputBuffer};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Command not found: {0}")]
    NotFound(Uuid),

    #[error("Session error: {0}")]
    Session(#[from] TransportError),

    #[error("Standard input of command {0} is closed")]
    StdinClosed(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
