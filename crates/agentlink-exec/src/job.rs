//! Background command jobs

use agentlink_proto::{CommandState, CommandSummary};
use agentlink_transport::{PipeReader, PipeWriter, ShellSession, TransportResult};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const READ_CHUNK: usize = 4096;

/// Output shared by the readers of one command
///
/// Bytes from stdout and stderr are appended as they arrive, so ordering is
/// kept within each stream while the two may interleave.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl OutputBuffer {
    pub fn append(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }

    pub fn snapshot(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Copy `reader` into the buffer until EOF or a read error
    pub async fn pump(&self, mut reader: PipeReader) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => self.append(&chunk[..n]),
            }
        }
    }
}

#[derive(Debug, Default)]
struct Outcome {
    exit_code: Option<i32>,
    error: Option<String>,
}

/// A command started in the background
pub struct CommandJob {
    pub id: Uuid,
    pub command: String,
    pub created_at: DateTime<Utc>,
    /// Creation order within the executor
    pub(crate) seq: u64,
    output: OutputBuffer,
    outcome: Mutex<Outcome>,
    stdin: tokio::sync::Mutex<Option<PipeWriter>>,
    session: Arc<dyn ShellSession>,
    /// Cancelled once the command ended or was killed
    done: CancellationToken,
}

impl std::fmt::Debug for CommandJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandJob")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("state", &self.state())
            .finish()
    }
}

impl CommandJob {
    pub(crate) fn new(
        command: &str,
        seq: u64,
        stdin: PipeWriter,
        session: Arc<dyn ShellSession>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.to_string(),
            created_at: Utc::now(),
            seq,
            output: OutputBuffer::default(),
            outcome: Mutex::new(Outcome::default()),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            session,
            done: CancellationToken::new(),
        }
    }

    pub fn output(&self) -> String {
        self.output.snapshot()
    }

    pub(crate) fn buffer(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn state(&self) -> CommandState {
        let outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        match (&outcome.error, outcome.exit_code) {
            (Some(error), _) => CommandState::Failed {
                error: error.clone(),
            },
            (None, Some(exit_code)) => CommandState::Completed { exit_code },
            (None, None) => CommandState::Running,
        }
    }

    pub fn summary(&self) -> CommandSummary {
        CommandSummary {
            id: self.id,
            command: self.command.clone(),
            state: self.state(),
        }
    }

    /// Record how the command ended. Only the first call has any effect.
    pub(crate) fn finish(&self, result: TransportResult<i32>) {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if outcome.exit_code.is_some() || outcome.error.is_some() {
            return;
        }
        match result {
            Ok(code) => outcome.exit_code = Some(code),
            Err(e) => outcome.error = Some(e.to_string()),
        }
    }

    pub(crate) fn session(&self) -> &Arc<dyn ShellSession> {
        &self.session
    }

    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub(crate) fn stdin(&self) -> &tokio::sync::Mutex<Option<PipeWriter>> {
        &self.stdin
    }
}
