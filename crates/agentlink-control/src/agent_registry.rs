//! Agent registry for tracking the agents of every workspace
//!
//! The registry is the storage behind the in-memory agent directory. It
//! holds both provisioned (root) agents and injected children, and enforces
//! the parent/child invariants: a child's parent must exist when the child
//! is created, a child can never parent another agent, and an agent with
//! children cannot be removed.

use agentlink_proto::{Agent, AgentStatus};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent {0} is already registered")]
    AlreadyRegistered(Uuid),

    #[error("Parent agent {0} not found")]
    ParentNotFound(Uuid),

    #[error("Agent {0} is a child agent and cannot create children")]
    ParentIsChild(Uuid),

    #[error("Agent {parent_id} already has a child named {name:?}")]
    DuplicateChildName { parent_id: Uuid, name: String },

    #[error("Agent {0} still has child agents")]
    HasChildren(Uuid),
}

/// Registry for managing workspace agents
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<Uuid, Agent>>>,
}

impl AgentRegistry {
    /// Create a new empty agent registry
    pub fn new() -> Self {
        tracing::info!("Creating new agent registry");
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new agent or re-register an existing one
    ///
    /// Returns the replaced agent, if any.
    pub fn register_or_replace(&self, agent: Agent) -> Option<Agent> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);

        let old_agent = agents.insert(agent.id, agent.clone());

        if let Some(ref replaced) = old_agent {
            tracing::info!(
                agent_id = %agent.id,
                name = %agent.name,
                old_status = %replaced.status,
                "Re-registered existing agent"
            );
        } else {
            tracing::info!(agent_id = %agent.id, name = %agent.name, "Registered new agent");
        }

        old_agent
    }

    /// Register a new agent (fails if already registered)
    pub fn register(&self, agent: Agent) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);

        if agents.contains_key(&agent.id) {
            tracing::warn!(agent_id = %agent.id, "Agent is already registered");
            return Err(RegistryError::AlreadyRegistered(agent.id));
        }

        tracing::info!(
            agent_id = %agent.id,
            name = %agent.name,
            workspace_id = %agent.workspace_id,
            "Registered new agent"
        );

        agents.insert(agent.id, agent);
        Ok(())
    }

    /// Create a child of `parent_id` in the parent's workspace
    pub fn create_child(
        &self,
        parent_id: Uuid,
        name: &str,
        directory: &str,
    ) -> Result<Agent, RegistryError> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);

        let parent = agents
            .get(&parent_id)
            .ok_or(RegistryError::ParentNotFound(parent_id))?;
        if parent.is_child() {
            return Err(RegistryError::ParentIsChild(parent_id));
        }
        if agents
            .values()
            .any(|a| a.parent_id == Some(parent_id) && a.name == name)
        {
            return Err(RegistryError::DuplicateChildName {
                parent_id,
                name: name.to_string(),
            });
        }

        let child = Agent {
            id: Uuid::new_v4(),
            parent_id: Some(parent_id),
            name: name.to_string(),
            status: AgentStatus::Disconnected,
            directory: directory.to_string(),
            workspace_id: parent.workspace_id,
            in_latest_build: parent.in_latest_build,
            sub_environment: Some(name.to_string()),
        };

        tracing::info!(
            agent_id = %child.id,
            parent_id = %parent_id,
            name = %name,
            "Created child agent"
        );

        agents.insert(child.id, child.clone());
        Ok(child)
    }

    /// Unregister an agent by ID
    ///
    /// Returns the agent if it was registered, or None if not found.
    pub fn unregister(&self, agent_id: Uuid) -> Result<Option<Agent>, RegistryError> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);

        if agents.values().any(|a| a.parent_id == Some(agent_id)) {
            return Err(RegistryError::HasChildren(agent_id));
        }

        let agent = agents.remove(&agent_id);
        if agent.is_some() {
            tracing::info!(agent_id = %agent_id, "Unregistered agent");
        } else {
            tracing::warn!(agent_id = %agent_id, "Attempted to unregister unknown agent");
        }

        Ok(agent)
    }

    /// Get information about a specific agent
    pub fn get(&self, agent_id: Uuid) -> Option<Agent> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.get(&agent_id).cloned()
    }

    /// List all registered agents
    pub fn list(&self) -> Vec<Agent> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.values().cloned().collect()
    }

    /// List the children of `parent_id`, ordered by name
    pub fn list_children(&self, parent_id: Uuid) -> Vec<Agent> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        let mut children: Vec<Agent> = agents
            .values()
            .filter(|a| a.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// Agents of `workspace_id` that are part of its latest build
    pub fn list_latest_build(&self, workspace_id: Uuid) -> Vec<Agent> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents
            .values()
            .filter(|a| a.workspace_id == workspace_id && a.in_latest_build)
            .cloned()
            .collect()
    }

    /// Update liveness; returns false if the agent is unknown
    pub fn set_status(&self, agent_id: Uuid, status: AgentStatus) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        match agents.get_mut(&agent_id) {
            Some(agent) => {
                if agent.status != status {
                    tracing::debug!(agent_id = %agent_id, status = %status, "Agent status changed");
                }
                agent.status = status;
                true
            }
            None => false,
        }
    }

    /// Move an agent (and its children) in or out of the latest build
    pub fn mark_latest_build(&self, agent_id: Uuid, in_latest_build: bool) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if !agents.contains_key(&agent_id) {
            return false;
        }
        for agent in agents.values_mut() {
            if agent.id == agent_id || agent.parent_id == Some(agent_id) {
                agent.in_latest_build = in_latest_build;
            }
        }
        true
    }

    /// Get the total count of registered agents
    pub fn count(&self) -> usize {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
