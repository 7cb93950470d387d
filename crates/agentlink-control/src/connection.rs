//! Agent connection broker
//!
//! Lazily establishes one tunnel per agent and reuses it across tool calls.
//! A cached connection is revalidated on every lookup; if its tunnel does not
//! become reachable within the configured bound it is closed, dropped and
//! replaced by a freshly dialed one. A connection is never patched in place.

use agentlink_transport::{RemoteShell, TransportError, Tunnel, TunnelProvider};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Agent {agent_id} did not become reachable within {timeout:?}")]
    Unreachable { agent_id: Uuid, timeout: Duration },
}

/// Represents an active agent connection
#[derive(Debug)]
pub struct AgentConnection {
    pub agent_id: Uuid,
    pub tunnel: Arc<dyn Tunnel>,
    shell: OnceCell<Arc<dyn RemoteShell>>,
}

impl AgentConnection {
    fn new(agent_id: Uuid, tunnel: Arc<dyn Tunnel>) -> Self {
        Self {
            agent_id,
            tunnel,
            shell: OnceCell::new(),
        }
    }

    pub fn has_shell(&self) -> bool {
        self.shell.initialized()
    }
}

/// Manages the tunnel connections to all agents
pub struct ConnectionBroker {
    provider: Arc<dyn TunnelProvider>,
    connections: Mutex<HashMap<Uuid, Arc<AgentConnection>>>,
    reachable_timeout: Duration,
}

impl ConnectionBroker {
    pub fn new(provider: Arc<dyn TunnelProvider>, reachable_timeout: Duration) -> Self {
        Self {
            provider,
            connections: Mutex::new(HashMap::new()),
            reachable_timeout,
        }
    }

    async fn is_reachable(&self, tunnel: &dyn Tunnel) -> bool {
        tokio::time::timeout(self.reachable_timeout, tunnel.await_reachable())
            .await
            .unwrap_or(false)
    }

    /// Return a reachable connection to `agent_id`, dialing if needed
    pub async fn ensure_connection(
        &self,
        agent_id: Uuid,
    ) -> Result<Arc<AgentConnection>, BrokerError> {
        let cached = self.get(agent_id);

        if let Some(conn) = cached {
            if self.is_reachable(conn.tunnel.as_ref()).await {
                return Ok(conn);
            }
            warn!(agent_id = %agent_id, "Cached tunnel is unreachable, redialing");
            self.remove_if_current(&conn).await;
        }

        let tunnel = self.provider.dial(agent_id).await?;
        if !self.is_reachable(tunnel.as_ref()).await {
            tunnel.close().await;
            return Err(BrokerError::Unreachable {
                agent_id,
                timeout: self.reachable_timeout,
            });
        }

        let conn = Arc::new(AgentConnection::new(agent_id, tunnel));
        let cached = {
            let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
            match connections.get(&agent_id) {
                Some(existing) => Some(existing.clone()),
                None => {
                    connections.insert(agent_id, conn.clone());
                    None
                }
            }
        };

        // Another caller cached a connection while we were dialing; use theirs.
        if let Some(existing) = cached {
            debug!(agent_id = %agent_id, "Lost dial race, closing duplicate tunnel");
            conn.tunnel.close().await;
            return Ok(existing);
        }

        info!(agent_id = %agent_id, "Agent connection established");
        Ok(conn)
    }

    /// Remote shell for `conn`, created on first use and reused afterwards
    ///
    /// The shell is not revalidated. Callers that get a session error from it
    /// should [`discard`](Self::discard) the agent and reconnect.
    pub async fn ensure_shell(
        &self,
        conn: &AgentConnection,
    ) -> Result<Arc<dyn RemoteShell>, BrokerError> {
        let shell = conn
            .shell
            .get_or_try_init(|| async {
                debug!(agent_id = %conn.agent_id, "Opening remote shell");
                conn.tunnel.open_shell().await
            })
            .await?;
        Ok(shell.clone())
    }

    /// Drop and close the cached connection for `agent_id`, if any
    pub async fn discard(&self, agent_id: Uuid) -> bool {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&agent_id);

        match removed {
            Some(conn) => {
                conn.tunnel.close().await;
                debug!(agent_id = %agent_id, "Agent connection discarded");
                true
            }
            None => false,
        }
    }

    /// Get a cached connection without revalidating it
    pub fn get(&self, agent_id: Uuid) -> Option<Arc<AgentConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .cloned()
    }

    /// List all connected agent IDs
    pub fn list_agents(&self) -> Vec<Uuid> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Get the count of connected agents
    pub fn count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close every tunnel
    pub async fn close_all(&self) {
        let drained: Vec<Arc<AgentConnection>> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in drained {
            conn.tunnel.close().await;
        }
    }

    async fn remove_if_current(&self, conn: &Arc<AgentConnection>) {
        {
            let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
            if connections
                .get(&conn.agent_id)
                .is_some_and(|current| Arc::ptr_eq(current, conn))
            {
                connections.remove(&conn.agent_id);
            }
        }
        conn.tunnel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentlink_transport::{LocalTunnelProvider, TransportResult};
    use async_trait::async_trait;

    /// Provider whose dial suspends, so concurrent callers overlap
    struct SlowProvider(LocalTunnelProvider);

    #[async_trait]
    impl TunnelProvider for SlowProvider {
        async fn dial(&self, agent_id: Uuid) -> TransportResult<Arc<dyn Tunnel>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.dial(agent_id).await
        }
    }

    fn broker() -> (Arc<LocalTunnelProvider>, ConnectionBroker) {
        let provider = Arc::new(LocalTunnelProvider::new());
        let broker = ConnectionBroker::new(provider.clone(), Duration::from_millis(200));
        (provider, broker)
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let (provider, broker) = broker();
        let agent_id = Uuid::new_v4();
        provider.register(agent_id);

        let first = broker.ensure_connection(agent_id).await.unwrap();
        let second = broker.ensure_connection(agent_id).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.dial_count(), 1);
        assert_eq!(broker.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_callers_share_one_open_connection() {
        let local = LocalTunnelProvider::new();
        let agent_id = Uuid::new_v4();
        local.register(agent_id);
        let broker = ConnectionBroker::new(
            Arc::new(SlowProvider(local)),
            Duration::from_millis(200),
        );

        let (a, b) = tokio::join!(
            broker.ensure_connection(agent_id),
            broker.ensure_connection(agent_id)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.tunnel.is_closed());
        assert_eq!(broker.count(), 1);
        assert!(Arc::ptr_eq(&broker.get(agent_id).unwrap(), &a));
    }

    #[tokio::test]
    async fn test_unreachable_connection_is_replaced() {
        let (provider, broker) = broker();
        let agent_id = Uuid::new_v4();
        provider.register(agent_id);

        let first = broker.ensure_connection(agent_id).await.unwrap();
        first.tunnel.close().await;

        let second = broker.ensure_connection(agent_id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(provider.dial_count(), 2);
        assert_eq!(broker.list_agents(), vec![agent_id]);
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_an_error() {
        let (provider, broker) = broker();
        let agent_id = Uuid::new_v4();
        provider.register(agent_id);
        provider.set_reachable(agent_id, false);

        let result = broker.ensure_connection(agent_id).await;
        assert!(matches!(result, Err(BrokerError::Unreachable { .. })));
        assert_eq!(broker.count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_an_error() {
        let (_provider, broker) = broker();
        let result = broker.ensure_connection(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(BrokerError::Transport(TransportError::AgentNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_shell_is_created_once() {
        let (provider, broker) = broker();
        let agent_id = Uuid::new_v4();
        provider.register(agent_id);

        let conn = broker.ensure_connection(agent_id).await.unwrap();
        assert!(!conn.has_shell());

        let first = broker.ensure_shell(&conn).await.unwrap();
        let second = broker.ensure_shell(&conn).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_discard_and_close_all() {
        let (provider, broker) = broker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        provider.register(a);
        provider.register(b);

        let conn_a = broker.ensure_connection(a).await.unwrap();
        let conn_b = broker.ensure_connection(b).await.unwrap();

        assert!(broker.discard(a).await);
        assert!(!broker.discard(a).await);
        assert!(conn_a.tunnel.is_closed());

        broker.close_all().await;
        assert!(conn_b.tunnel.is_closed());
        assert_eq!(broker.count(), 0);
    }
}
