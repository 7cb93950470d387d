//! Tunnel abstraction layer for agent connections
//!
//! The control plane never talks to an agent directly. It asks a
//! [`TunnelProvider`] for a [`Tunnel`] to the agent, dials TCP through it for
//! port forwarding, and opens a [`RemoteShell`] on it for command execution.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │      Connection broker / executor / port forwarder       │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │           agentlink-transport (this crate)               │
//! │  - TunnelProvider   - Tunnel                             │
//! │  - RemoteShell      - ShellSession                       │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────────────────────┬────────────────────────────┐
//! │ LocalTunnelProvider        │ Mesh / relay providers     │
//! │ (direct TCP + local sh)    │ (external)                 │
//! └────────────────────────────┴────────────────────────────┘
//! ```

pub mod local;


use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

pub use local::{LocalShell, LocalShellSession, LocalTunnel, LocalTunnelProvider};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Agent {0} is unreachable")]
    Unreachable(Uuid),

    #[error("Session closed")]
    SessionClosed,

    #[error("Shell error: {0}")]
    ShellError(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream dialed through a tunnel
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Read end of a shell session pipe (stdout or stderr)
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write end of a shell session pipe (stdin)
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens tunnels to agents
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Dial a new tunnel to `agent_id`
    ///
    /// Returns as soon as the tunnel exists; callers decide how long to wait
    /// for it to become reachable.
    async fn dial(&self, agent_id: Uuid) -> TransportResult<Arc<dyn Tunnel>>;
}

/// A tunnel to one agent
#[async_trait]
pub trait Tunnel: Send + Sync + Debug {
    fn agent_id(&self) -> Uuid;

    /// Resolve once the agent answers, or `false` if it never will
    ///
    /// Callers bound this with a timeout.
    async fn await_reachable(&self) -> bool;

    /// Dial `addr` as seen from inside the agent
    async fn dial_tcp(&self, addr: SocketAddr) -> TransportResult<BoxedStream>;

    /// Open a remote shell channel on top of this tunnel
    async fn open_shell(&self) -> TransportResult<Arc<dyn RemoteShell>>;

    /// Tear the tunnel down. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A shell channel able to create independent sessions
#[async_trait]
pub trait RemoteShell: Send + Sync + Debug {
    async fn new_session(&self) -> TransportResult<Box<dyn ShellSession>>;
}

/// One command execution on a remote shell
///
/// Pipes must be requested before [`ShellSession::start`]. Once started the
/// session is usually shared (`Arc`), so `wait` and `close` take `&self`.
#[async_trait]
pub trait ShellSession: Send + Sync + Debug {
    fn stdout_pipe(&mut self) -> TransportResult<PipeReader>;

    fn stderr_pipe(&mut self) -> TransportResult<PipeReader>;

    fn stdin_pipe(&mut self) -> TransportResult<PipeWriter>;

    async fn start(&mut self, command: &str) -> TransportResult<()>;

    /// Wait for the command to finish
    ///
    /// `Ok(code)` for any process exit, zero or not. `Err` when the session
    /// itself failed or was closed before the process exited.
    async fn wait(&self) -> TransportResult<i32>;

    /// Close the session, terminating the command if it is still running
    async fn close(&self);
}
