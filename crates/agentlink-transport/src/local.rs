//! Local tunnel provider
//!
//! Tunnels dial TCP directly from this host and the remote shell is a local
//! `sh -c` process. Used to run the control plane against agents on the same
//! machine and as the provider in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    BoxedStream, PipeReader, PipeWriter, RemoteShell, ShellSession, TransportError,
    TransportResult, Tunnel, TunnelProvider,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Tunnel provider for agents reachable from this host
#[derive(Debug, Default)]
pub struct LocalTunnelProvider {
    agents: RwLock<HashMap<Uuid, Arc<AtomicBool>>>,
    dials: AtomicUsize,
}

impl LocalTunnelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `agent_id` dialable and reachable
    pub fn register(&self, agent_id: Uuid) {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id, Arc::new(AtomicBool::new(true)));
    }

    pub fn unregister(&self, agent_id: Uuid) {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&agent_id);
    }

    /// Flip reachability of every tunnel to `agent_id`, existing ones included
    pub fn set_reachable(&self, agent_id: Uuid, reachable: bool) {
        if let Some(flag) = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
        {
            flag.store(reachable, Ordering::SeqCst);
        }
    }

    /// Number of tunnels dialed so far
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelProvider for LocalTunnelProvider {
    async fn dial(&self, agent_id: Uuid) -> TransportResult<Arc<dyn Tunnel>> {
        let reachable = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .cloned()
            .ok_or(TransportError::AgentNotFound(agent_id))?;

        self.dials.fetch_add(1, Ordering::SeqCst);
        debug!(agent_id = %agent_id, "Dialed local tunnel");

        Ok(Arc::new(LocalTunnel {
            agent_id,
            reachable,
            closed: CancellationToken::new(),
        }))
    }
}

#[derive(Debug)]
pub struct LocalTunnel {
    agent_id: Uuid,
    reachable: Arc<AtomicBool>,
    closed: CancellationToken,
}

#[async_trait]
impl Tunnel for LocalTunnel {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    async fn await_reachable(&self) -> bool {
        !self.closed.is_cancelled() && self.reachable.load(Ordering::SeqCst)
    }

    async fn dial_tcp(&self, addr: SocketAddr) -> TransportResult<BoxedStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(self.agent_id));
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;
        Ok(Box::new(stream))
    }

    async fn open_shell(&self) -> TransportResult<Arc<dyn RemoteShell>> {
        if self.closed.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        Ok(Arc::new(LocalShell {
            agent_id: self.agent_id,
            tunnel_closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(agent_id = %self.agent_id, "Closing local tunnel");
            self.closed.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Shell bound to a local tunnel; goes stale once the tunnel is closed
#[derive(Debug)]
pub struct LocalShell {
    agent_id: Uuid,
    tunnel_closed: CancellationToken,
}

#[async_trait]
impl RemoteShell for LocalShell {
    async fn new_session(&self) -> TransportResult<Box<dyn ShellSession>> {
        if self.tunnel_closed.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        Ok(Box::new(LocalShellSession::new(
            self.agent_id,
            self.tunnel_closed.child_token(),
        )))
    }
}

/// A `sh -c` process with its stdio bridged through in-memory pipes
#[derive(Debug)]
pub struct LocalShellSession {
    agent_id: Uuid,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin: Option<DuplexStream>,
    started: bool,
    child: tokio::sync::Mutex<Option<Child>>,
    done: CancellationToken,
}

impl LocalShellSession {
    fn new(agent_id: Uuid, done: CancellationToken) -> Self {
        Self {
            agent_id,
            stdout: None,
            stderr: None,
            stdin: None,
            started: false,
            child: tokio::sync::Mutex::new(None),
            done,
        }
    }

    fn check_unstarted(&self) -> TransportResult<()> {
        if self.started {
            return Err(TransportError::ShellError(
                "pipes must be requested before start".to_string(),
            ));
        }
        Ok(())
    }
}

fn stdio_for(requested: bool) -> Stdio {
    if requested {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

#[async_trait]
impl ShellSession for LocalShellSession {
    fn stdout_pipe(&mut self) -> TransportResult<PipeReader> {
        self.check_unstarted()?;
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdout = Some(ours);
        Ok(Box::new(theirs))
    }

    fn stderr_pipe(&mut self) -> TransportResult<PipeReader> {
        self.check_unstarted()?;
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.stderr = Some(ours);
        Ok(Box::new(theirs))
    }

    fn stdin_pipe(&mut self) -> TransportResult<PipeWriter> {
        self.check_unstarted()?;
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdin = Some(ours);
        Ok(Box::new(theirs))
    }

    async fn start(&mut self, command: &str) -> TransportResult<()> {
        self.check_unstarted()?;
        if self.done.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(stdio_for(self.stdin.is_some()))
            .stdout(stdio_for(self.stdout.is_some()))
            .stderr(stdio_for(self.stderr.is_some()))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::ShellError(format!("failed to spawn shell: {}", e)))?;
        self.started = true;

        if let (Some(mut out), Some(mut pipe)) = (child.stdout.take(), self.stdout.take()) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut out, &mut pipe).await;
                let _ = pipe.shutdown().await;
            });
        }
        if let (Some(mut err), Some(mut pipe)) = (child.stderr.take(), self.stderr.take()) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut err, &mut pipe).await;
                let _ = pipe.shutdown().await;
            });
        }
        if let (Some(mut input), Some(mut pipe)) = (child.stdin.take(), self.stdin.take()) {
            let done = self.done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::io::copy(&mut pipe, &mut input) => {}
                    _ = done.cancelled() => {}
                }
            });
        }

        debug!(agent_id = %self.agent_id, "Started local shell session");
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn wait(&self) -> TransportResult<i32> {
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| TransportError::ShellError("session not started".to_string()))?;

        let exited = tokio::select! {
            biased;
            status = child.wait() => Some(status),
            _ = self.done.cancelled() => None,
        };

        match exited {
            Some(status) => {
                self.done.cancel();
                let status = status?;
                status.code().ok_or_else(|| {
                    TransportError::ShellError(format!("command terminated by signal ({})", status))
                })
            }
            None => {
                if let Err(e) = child.kill().await {
                    warn!(agent_id = %self.agent_id, "Failed to kill shell process: {}", e);
                }
                Err(TransportError::SessionClosed)
            }
        }
    }

    async fn close(&self) {
        self.done.cancel();
        // A concurrent wait() holds the lock and kills the child itself.
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}
