//! Control plane for the agent fleet
//!
//! Tracks agents and their parent/child relationships, injects child agents
//! into discovered containers and brokers tunnel connections to agents.
pub mod agent_registry;
pub mod bootstrap;
pub mod connection;
pub mod directory;
pub mod injector;
pub mod runtime;

pub use agent_registry::{AgentRegistry, RegistryError};
pub use bootstrap::{BootstrapError, BootstrapSource, DownloadBootstrap, FileBootstrap};
pub use connection::{AgentConnection, BrokerError, ConnectionBroker};
pub use directory::{AgentDirectory, DirectoryError, InMemoryAgentDirectory};
pub use injector::{Injector, InjectorConfig, InjectorError};
pub use runtime::{ContainerRuntime, DockerCli, ExecOutput, RuntimeError, SubEnvironmentLister};
