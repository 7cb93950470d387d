//! Command executor
//!
//! Owns the table of background jobs. Each started job gets two reader tasks
//! (stdout, stderr) appending into one buffer and a waiter task that records
//! exactly one terminal outcome once the session ends and the readers have
//! drained.

use agentlink_proto::{CommandState, CommandSummary};
use agentlink_transport::{PipeWriter, ShellSession};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::{CommandJob, OutputBuffer};
use crate::ExecError;

/// How long the waiter lets readers drain after the command ended
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a synchronous command run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Combined stdout and stderr
    pub output: String,
    pub exit_code: i32,
}

pub struct CommandExecutor {
    jobs: Mutex<HashMap<Uuid, Arc<CommandJob>>>,
    next_seq: AtomicU64,
    drain_timeout: Duration,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::with_drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            drain_timeout,
        }
    }

    /// Start `command` on `session` in the background and return its job id
    ///
    /// If a pipe cannot be opened or the command cannot be started the error
    /// is returned and no job is registered.
    pub async fn start(
        &self,
        mut session: Box<dyn ShellSession>,
        command: &str,
    ) -> Result<Uuid, ExecError> {
        let stdout = session.stdout_pipe()?;
        let stderr = session.stderr_pipe()?;
        let stdin = session.stdin_pipe()?;

        if let Err(e) = session.start(command).await {
            session.close().await;
            return Err(e.into());
        }

        let session: Arc<dyn ShellSession> = Arc::from(session);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let job = Arc::new(CommandJob::new(command, seq, stdin, session.clone()));
        let id = job.id;

        let stdout_reader = {
            let job = job.clone();
            tokio::spawn(async move { job.buffer().pump(stdout).await })
        };
        let stderr_reader = {
            let job = job.clone();
            tokio::spawn(async move { job.buffer().pump(stderr).await })
        };

        let drain_timeout = self.drain_timeout;
        let waiter_job = job.clone();
        tokio::spawn(async move {
            let result = session.wait().await;
            let drained = tokio::time::timeout(drain_timeout, async {
                let _ = stdout_reader.await;
                let _ = stderr_reader.await;
            })
            .await;
            if drained.is_err() {
                warn!(command_id = %waiter_job.id, "Output readers did not drain in time");
            }
            waiter_job.finish(result);
            waiter_job.done().cancel();
            debug!(command_id = %waiter_job.id, state = %waiter_job.state(), "Command finished");
        });

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, job);

        info!(command_id = %id, command = %command, "Started background command");
        Ok(id)
    }

    fn get(&self, id: Uuid) -> Result<Arc<CommandJob>, ExecError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(ExecError::NotFound(id))
    }

    pub fn status(&self, id: Uuid) -> Result<CommandState, ExecError> {
        Ok(self.get(id)?.state())
    }

    /// Everything the command has written so far
    pub fn output(&self, id: Uuid) -> Result<String, ExecError> {
        Ok(self.get(id)?.output())
    }

    /// Remove the job and close its session
    ///
    /// The waiter observes the closed session and records a failure.
    pub async fn kill(&self, id: Uuid) -> Result<(), ExecError> {
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(ExecError::NotFound(id))?;

        // A blocked stdin write holds the lock; it sees `done` and releases.
        job.done().cancel();
        job.session().close().await;
        if let Ok(mut stdin) = job.stdin().try_lock() {
            stdin.take();
        }

        info!(command_id = %id, "Killed background command");
        Ok(())
    }

    /// All jobs in creation order
    pub fn list(&self) -> Vec<CommandSummary> {
        let mut jobs: Vec<Arc<CommandJob>> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.seq);
        jobs.iter().map(|job| job.summary()).collect()
    }

    /// Write `input` to the job's standard input
    ///
    /// Gives up with [`ExecError::StdinClosed`] once the command ends or is
    /// killed, even if the write is blocked on a full pipe.
    pub async fn write_stdin(&self, id: Uuid, input: &[u8]) -> Result<usize, ExecError> {
        let job = self.get(id)?;
        let done = job.done();

        let mut stdin = tokio::select! {
            _ = done.cancelled() => return Err(ExecError::StdinClosed(id)),
            guard = job.stdin().lock() => guard,
        };
        let Some(writer) = stdin.as_mut() else {
            return Err(ExecError::StdinClosed(id));
        };

        let written = tokio::select! {
            biased;
            result = write_and_flush(writer, input) => Some(result),
            _ = done.cancelled() => None,
        };

        match written {
            Some(Ok(())) => Ok(input.len()),
            Some(Err(e)) => {
                stdin.take();
                Err(e.into())
            }
            None => {
                stdin.take();
                Err(ExecError::StdinClosed(id))
            }
        }
    }

    /// Close the job's standard input so the command sees EOF
    pub async fn close_stdin(&self, id: Uuid) -> Result<(), ExecError> {
        let job = self.get(id)?;
        tokio::select! {
            _ = job.done().cancelled() => {}
            mut stdin = job.stdin().lock() => {
                stdin.take();
            }
        }
        Ok(())
    }

    /// Run `command` to completion and return its combined output
    ///
    /// A non-zero exit code is a successful run; only session failures are
    /// errors.
    pub async fn run(
        &self,
        mut session: Box<dyn ShellSession>,
        command: &str,
    ) -> Result<RunOutput, ExecError> {
        let stdout = session.stdout_pipe()?;
        let stderr = session.stderr_pipe()?;

        if let Err(e) = session.start(command).await {
            session.close().await;
            return Err(e.into());
        }

        let buffer = OutputBuffer::default();
        let (_, _, result) = tokio::join!(
            buffer.pump(stdout),
            buffer.pump(stderr),
            session.wait()
        );
        session.close().await;

        let exit_code = result?;
        debug!(command = %command, exit_code = exit_code, "Command completed");
        Ok(RunOutput {
            output: buffer.snapshot(),
            exit_code,
        })
    }

    pub fn count(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn write_and_flush(writer: &mut PipeWriter, input: &[u8]) -> std::io::Result<()> {
    writer.write_all(input).await?;
    writer.flush().await
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}
