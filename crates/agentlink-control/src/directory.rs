//! Agent directory service
//!
//! The directory is the control plane's source of truth for agents. The
//! injector creates and deletes children through it, and the log streamer
//! reads latest-build membership from it.

use agentlink_proto::{Agent, ChildAgent, CreatedChildAgent};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::agent_registry::{AgentRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Agent not found: {0}")]
    NotFound(Uuid),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Agent directory as seen by one parent agent
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Create a child of the calling agent, returning its id and credential
    async fn create_child_agent(
        &self,
        name: &str,
        directory: &str,
    ) -> Result<CreatedChildAgent, DirectoryError>;

    async fn delete_child_agent(&self, id: Uuid) -> Result<(), DirectoryError>;

    async fn list_child_agents(&self) -> Result<Vec<ChildAgent>, DirectoryError>;

    async fn get_agent(&self, id: Uuid) -> Result<Agent, DirectoryError>;

    /// Agents that belong to the latest build of `workspace_id`
    async fn list_agents_for_latest_build(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<Agent>, DirectoryError>;
}

/// Directory backed by an in-process [`AgentRegistry`], scoped to one parent
#[derive(Debug, Clone)]
pub struct InMemoryAgentDirectory {
    registry: AgentRegistry,
    parent_id: Uuid,
}

impl InMemoryAgentDirectory {
    pub fn new(registry: AgentRegistry, parent_id: Uuid) -> Self {
        Self {
            registry,
            parent_id,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn parent_id(&self) -> Uuid {
        self.parent_id
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn create_child_agent(
        &self,
        name: &str,
        directory: &str,
    ) -> Result<CreatedChildAgent, DirectoryError> {
        let child = self.registry.create_child(self.parent_id, name, directory)?;
        Ok(CreatedChildAgent {
            id: child.id,
            auth_token: Uuid::new_v4(),
        })
    }

    async fn delete_child_agent(&self, id: Uuid) -> Result<(), DirectoryError> {
        // Only our own children can be deleted through this directory.
        match self.registry.get(id) {
            Some(agent) if agent.parent_id == Some(self.parent_id) => {
                self.registry.unregister(id)?;
                Ok(())
            }
            _ => Err(DirectoryError::NotFound(id)),
        }
    }

    async fn list_child_agents(&self) -> Result<Vec<ChildAgent>, DirectoryError> {
        Ok(self
            .registry
            .list_children(self.parent_id)
            .into_iter()
            .map(|agent| ChildAgent {
                id: agent.id,
                name: agent.name,
            })
            .collect())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Agent, DirectoryError> {
        self.registry.get(id).ok_or(DirectoryError::NotFound(id))
    }

    async fn list_agents_for_latest_build(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<Agent>, DirectoryError> {
        Ok(self.registry.list_latest_build(workspace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> InMemoryAgentDirectory {
        let registry = AgentRegistry::new();
        let parent = Agent::root(Uuid::new_v4(), "main", Uuid::new_v4());
        let parent_id = parent.id;
        registry.register(parent).unwrap();
        InMemoryAgentDirectory::new(registry, parent_id)
    }

    #[tokio::test]
    async fn test_create_list_delete_child() {
        let directory = directory();

        let created = directory
            .create_child_agent("ws-1", "/home/user")
            .await
            .unwrap();
        let children = directory.list_child_agents().await.unwrap();
        assert_eq!(
            children,
            vec![ChildAgent {
                id: created.id,
                name: "ws-1".to_string()
            }]
        );

        directory.delete_child_agent(created.id).await.unwrap();
        assert!(directory.list_child_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_foreign_agent_is_not_found() {
        let directory = directory();
        let parent_id = directory.parent_id();

        let result = directory.delete_child_agent(parent_id).await;
        assert!(matches!(result, Err(DirectoryError::NotFound(id)) if id == parent_id));
    }

    #[tokio::test]
    async fn test_latest_build_listing() {
        let directory = directory();
        let parent = directory.get_agent(directory.parent_id()).await.unwrap();
        directory.create_child_agent("ws-1", "/w").await.unwrap();

        let agents = directory
            .list_agents_for_latest_build(parent.workspace_id)
            .await
            .unwrap();
        assert_eq!(agents.len(), 2);
    }
}
