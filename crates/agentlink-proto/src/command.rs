//! Background command job states

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Observable state of a command job
///
/// A non-zero exit code is a successful remote execution and is reported as
/// `Completed`; `Failed` means the execution itself could not be completed
/// (transport failure, closed or killed session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommandState {
    Running,
    Completed { exit_code: i32 },
    Failed { error: String },
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::Running)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandState::Running => write!(f, "is still running..."),
            CommandState::Completed { exit_code } => write!(f, "exited with code {}", exit_code),
            CommandState::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSummary {
    pub id: Uuid,
    pub command: String,
    #[serde(flatten)]
    pub state: CommandState,
}
