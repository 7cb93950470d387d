//! Local port forwarding into agents
//!
//! Each forward binds a local TCP port and relays every accepted connection
//! to `127.0.0.1:<remote_port>` as seen from inside the agent, through the
//! agent's tunnel.

use agentlink_control::{BrokerError, ConnectionBroker};
use agentlink_proto::ForwardSummary;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Port forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Local port {0} is already forwarded")]
    AlreadyForwarded(u16),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("No port forward found for local port {0}")]
    NotFound(u16),

    #[error("Connection error: {0}")]
    Broker(#[from] BrokerError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

struct ActiveForward {
    agent_id: Uuid,
    remote_port: u16,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveForward {
    fn summary(&self) -> ForwardSummary {
        ForwardSummary {
            agent_id: self.agent_id,
            local_port: self.local_addr.port(),
            remote_port: self.remote_port,
            local_address: self.local_addr.to_string(),
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        // The listener is dropped when the accept loop returns.
        let _ = self.task.await;
    }
}

/// Registry of active port forwards, keyed by local port
pub struct PortForwarder {
    broker: Arc<ConnectionBroker>,
    forwards: Mutex<HashMap<u16, ActiveForward>>,
    bind_host: String,
}

impl PortForwarder {
    pub fn new(broker: Arc<ConnectionBroker>, bind_host: impl Into<String>) -> Self {
        Self {
            broker,
            forwards: Mutex::new(HashMap::new()),
            bind_host: bind_host.into(),
        }
    }

    fn is_forwarded(&self, local_port: u16) -> bool {
        self.forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&local_port)
    }

    /// Forward `local_port` to `remote_port` inside `agent_id`
    ///
    /// A `local_port` of 0 binds an ephemeral port. Returns the forward as
    /// registered, under the port actually bound.
    pub async fn start(
        &self,
        agent_id: Uuid,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ForwardSummary, ForwardError> {
        if local_port != 0 && self.is_forwarded(local_port) {
            return Err(ForwardError::AlreadyForwarded(local_port));
        }

        self.broker.ensure_connection(agent_id).await?;

        let listener = TcpListener::bind((self.bind_host.as_str(), local_port))
            .await
            .map_err(|e| ForwardError::BindError {
                address: self.bind_host.clone(),
                port: local_port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        let bound_port = local_addr.port();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.broker.clone(),
            agent_id,
            remote_port,
            cancel.clone(),
        ));
        let forward = ActiveForward {
            agent_id,
            remote_port,
            local_addr,
            cancel,
            task,
        };
        let summary = forward.summary();

        let rejected = {
            let mut forwards = self.forwards.lock().unwrap_or_else(PoisonError::into_inner);
            if forwards.contains_key(&bound_port) {
                Some(forward)
            } else {
                forwards.insert(bound_port, forward);
                None
            }
        };
        if let Some(forward) = rejected {
            forward.shutdown().await;
            return Err(ForwardError::AlreadyForwarded(bound_port));
        }

        info!(
            agent_id = %agent_id,
            local_addr = %local_addr,
            remote_port = remote_port,
            "Port forward started"
        );
        Ok(summary)
    }

    /// Stop the forward on `local_port`
    ///
    /// Returns once the listener is closed, so the port can be reused
    /// immediately.
    pub async fn stop(&self, local_port: u16) -> Result<(), ForwardError> {
        let forward = self
            .forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&local_port)
            .ok_or(ForwardError::NotFound(local_port))?;

        forward.shutdown().await;
        info!(local_port = local_port, "Port forward stopped");
        Ok(())
    }

    /// Active forwards ordered by local port
    pub fn list(&self) -> Vec<ForwardSummary> {
        let mut forwards: Vec<ForwardSummary> = self
            .forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(ActiveForward::summary)
            .collect();
        forwards.sort_by_key(|f| f.local_port);
        forwards
    }

    pub async fn stop_all(&self) {
        let drained: Vec<ActiveForward> = self
            .forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, forward)| forward)
            .collect();

        for forward in drained {
            forward.shutdown().await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker: Arc<ConnectionBroker>,
    agent_id: Uuid,
    remote_port: u16,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(agent_id = %agent_id, remote_port = remote_port, "Accept loop stopped");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((socket, peer_addr)) => {
                        debug!("Accepted forwarded connection from {}", peer_addr);
                        let broker = broker.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = relay(socket, broker, agent_id, remote_port) => {}
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept forwarded connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Relay one local connection to the agent; closing either side ends both
async fn relay(
    mut socket: TcpStream,
    broker: Arc<ConnectionBroker>,
    agent_id: Uuid,
    remote_port: u16,
) {
    let remote_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, remote_port));

    let conn = match broker.ensure_connection(agent_id).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(agent_id = %agent_id, "Dropping forwarded connection: {}", e);
            return;
        }
    };
    let mut remote = match conn.tunnel.dial_tcp(remote_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            debug!(agent_id = %agent_id, remote_addr = %remote_addr, "Remote dial failed: {}", e);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut socket, &mut remote).await {
        Ok((to_remote, to_local)) => {
            debug!(to_remote = to_remote, to_local = to_local, "Forwarded connection closed");
        }
        Err(e) => {
            debug!("Forwarded connection ended with error: {}", e);
        }
    }
}
