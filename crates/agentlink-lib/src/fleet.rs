//! Wiring of the fleet components from one configuration

use agentlink_control::{
    AgentRegistry, BootstrapSource, ConnectionBroker, ContainerRuntime, DownloadBootstrap,
    FileBootstrap, InMemoryAgentDirectory, Injector, RegistryError, SubEnvironmentLister,
};
use agentlink_exec::CommandExecutor;
use agentlink_forward::PortForwarder;
use agentlink_logstream::{
    InMemoryLogStore, InMemoryPubsub, LogIngestor, LogStore, LogStreamer, Pubsub,
};
use agentlink_proto::Agent;
use agentlink_transport::TunnelProvider;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::AgentlinkConfig;
use crate::tools::ToolService;

/// All components serving one parent agent
pub struct Fleet {
    pub config: AgentlinkConfig,
    pub parent: Agent,
    pub registry: AgentRegistry,
    pub directory: Arc<InMemoryAgentDirectory>,
    pub broker: Arc<ConnectionBroker>,
    pub executor: Arc<CommandExecutor>,
    pub forwarder: Arc<PortForwarder>,
    pub log_store: Arc<dyn LogStore>,
    pub pubsub: Arc<dyn Pubsub>,
    /// Log pipeline; not part of the tool surface
    pub ingestor: Arc<LogIngestor>,
    pub streamer: Arc<LogStreamer>,
    pub tools: Arc<ToolService>,
}

impl Fleet {
    /// Build the fleet and register the parent agent
    pub fn new(
        config: AgentlinkConfig,
        provider: Arc<dyn TunnelProvider>,
    ) -> Result<Self, RegistryError> {
        let mut parent = Agent::root(
            config.agent.id.unwrap_or_else(Uuid::new_v4),
            config.agent.name.clone(),
            config.agent.workspace_id.unwrap_or_else(Uuid::new_v4),
        );
        parent.directory = config.agent.directory.clone();

        let registry = AgentRegistry::new();
        registry.register(parent.clone())?;
        let directory = Arc::new(InMemoryAgentDirectory::new(registry.clone(), parent.id));

        let broker = Arc::new(ConnectionBroker::new(
            provider,
            config.broker.reachable_timeout,
        ));
        let executor = Arc::new(CommandExecutor::with_drain_timeout(
            config.exec.drain_timeout,
        ));
        let forwarder = Arc::new(PortForwarder::new(
            broker.clone(),
            config.forward.bind_host.clone(),
        ));

        let log_store: Arc<dyn LogStore> =
            Arc::new(InMemoryLogStore::with_limit(config.logs.max_bytes_per_agent));
        let pubsub: Arc<dyn Pubsub> = Arc::new(InMemoryPubsub::new());
        let ingestor = Arc::new(LogIngestor::new(
            log_store.clone(),
            pubsub.clone(),
            directory.clone(),
        ));
        let streamer = Arc::new(LogStreamer::new(
            log_store.clone(),
            pubsub.clone(),
            directory.clone(),
            config.logs.streamer_config(),
        ));

        let tools = Arc::new(ToolService::new(
            broker.clone(),
            executor.clone(),
            forwarder.clone(),
        ));

        info!(
            agent_id = %parent.id,
            workspace_id = %parent.workspace_id,
            "Fleet initialized"
        );

        Ok(Self {
            config,
            parent,
            registry,
            directory,
            broker,
            executor,
            forwarder,
            log_store,
            pubsub,
            ingestor,
            streamer,
            tools,
        })
    }

    /// Where injected agents get their payload from, if configured
    ///
    /// A local path wins over an explicit URL, which wins over the URL
    /// derived from the access URL.
    pub fn bootstrap_source(&self) -> Option<Arc<dyn BootstrapSource>> {
        let injector = &self.config.injector;
        if let Some(path) = &injector.bootstrap_path {
            return Some(Arc::new(FileBootstrap::new(path.clone())));
        }
        if let Some(url) = &injector.bootstrap_url {
            return Some(Arc::new(DownloadBootstrap::new(
                url.clone(),
                injector.bootstrap_cache.clone(),
            )));
        }
        if !injector.access_url.is_empty() {
            return Some(Arc::new(DownloadBootstrap::for_access_url(
                &injector.access_url,
                injector.bootstrap_cache.clone(),
            )));
        }
        None
    }

    /// Injector creating children of the parent agent
    pub fn injector(
        &self,
        lister: Arc<dyn SubEnvironmentLister>,
        runtime: Arc<dyn ContainerRuntime>,
        bootstrap: Arc<dyn BootstrapSource>,
    ) -> Arc<Injector> {
        Arc::new(Injector::new(
            self.config.injector.injector_config(),
            self.directory.clone(),
            lister,
            runtime,
            bootstrap,
        ))
    }

    pub async fn shutdown(&self) {
        self.tools.shutdown().await;
    }
}
