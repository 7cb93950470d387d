//! Child agent injector
//!
//! Periodically reconciles the containers running next to the parent agent
//! with the parent's child agents. Every container carrying a non-empty
//! workspace directory label gets a child agent created in the directory and
//! the agent binary copied in and launched. Containers that disappear have
//! their child agent deleted.
//!
//! The container → child mapping is only mutated after the directory has
//! confirmed the change, so injection is at-least-once: a failure after the
//! child was created but before the launch was accepted deletes the child
//! again and the container is retried on the next tick.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agentlink_proto::{CreatedChildAgent, SubEnvironment, WORKSPACE_DIRECTORY_LABEL};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bootstrap::{BootstrapError, BootstrapSource};
use crate::directory::{AgentDirectory, DirectoryError};
use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeError, SubEnvironmentLister};

pub const AGENT_URL_ENV: &str = "AGENTLINK_AGENT_URL";
pub const AGENT_AUTH_ENV: &str = "AGENTLINK_AGENT_AUTH";
pub const AGENT_TOKEN_ENV: &str = "AGENTLINK_AGENT_TOKEN";

#[derive(Debug, Error)]
pub enum InjectorError {
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
}

#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Time between reconciliation ticks
    pub interval: Duration,
    /// Control plane URL handed to launched agents
    pub access_url: String,
    /// Where the payload is copied inside each container
    pub payload_dest: String,
    /// Label that marks a container as a workspace and carries its directory
    pub directory_label: String,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            access_url: String::new(),
            payload_dest: "/tmp/agentlink-agent".to_string(),
            directory_label: WORKSPACE_DIRECTORY_LABEL.to_string(),
        }
    }
}

pub struct Injector {
    config: InjectorConfig,
    directory: Arc<dyn AgentDirectory>,
    lister: Arc<dyn SubEnvironmentLister>,
    runtime: Arc<dyn ContainerRuntime>,
    bootstrap: Arc<dyn BootstrapSource>,
    /// Container id -> child agent id
    children: Mutex<HashMap<String, Uuid>>,
}

impl Injector {
    pub fn new(
        config: InjectorConfig,
        directory: Arc<dyn AgentDirectory>,
        lister: Arc<dyn SubEnvironmentLister>,
        runtime: Arc<dyn ContainerRuntime>,
        bootstrap: Arc<dyn BootstrapSource>,
    ) -> Self {
        Self {
            config,
            directory,
            lister,
            runtime,
            bootstrap,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the container → child agent mapping
    pub fn children(&self) -> HashMap<String, Uuid> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Seed the mapping from children created by a previous run
    ///
    /// Children are matched to containers by name.
    pub async fn populate_children(&self) -> Result<usize, InjectorError> {
        let children = self.directory.list_child_agents().await?;
        let containers = self.lister.list().await?;

        let by_name: HashMap<&str, &str> = containers
            .iter()
            .map(|c| (c.friendly_name.as_str(), c.id.as_str()))
            .collect();

        let mut mapping = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found = 0;
        for child in &children {
            if let Some(container_id) = by_name.get(child.name.as_str()) {
                debug!(container_id = %container_id, agent_id = %child.id, "Found existing child");
                mapping.insert(container_id.to_string(), child.id);
                found += 1;
            }
        }
        Ok(found)
    }

    /// Prepare the payload and spawn the reconciliation loop
    ///
    /// Failing to seed the mapping is logged and the loop still starts.
    /// Failing to prepare the payload is returned: nothing can be injected
    /// without it.
    pub async fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, InjectorError> {
        info!(interval = ?self.config.interval, "Starting injector");

        if let Err(e) = self.populate_children().await {
            error!("Failed to populate children: {}", e);
        }

        let payload = self.bootstrap.prepare().await?;

        let handle = tokio::spawn(async move {
            let period = self.config.interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Injector stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick(&payload).await;
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Run one injection pass and one cleanup pass
    pub async fn tick(&self, payload: &Path) {
        if let Err(e) = self.run_injection_pass(payload).await {
            error!("Injection pass failed: {}", e);
        }
        if let Err(e) = self.run_cleanup_pass().await {
            error!("Cleanup pass failed: {}", e);
        }
    }

    /// Inject every eligible container that has no child yet
    ///
    /// Returns the number of children launched. A failure for one container
    /// is logged and does not stop the others.
    pub async fn run_injection_pass(&self, payload: &Path) -> Result<usize, InjectorError> {
        let containers = self.lister.list().await?;
        let mut injected = 0;

        for container in &containers {
            let Some(directory) = container.label_value(&self.config.directory_label) else {
                continue;
            };
            if self.is_injected(&container.id) {
                continue;
            }

            match self.inject(container, directory, payload).await {
                Ok(agent_id) => {
                    info!(
                        container_id = %container.id,
                        agent_id = %agent_id,
                        name = %container.friendly_name,
                        "Injected child agent"
                    );
                    injected += 1;
                }
                Err(e) => {
                    warn!(container_id = %container.id, "Failed to inject child agent: {}", e);
                }
            }
        }

        Ok(injected)
    }

    /// Delete children whose container is gone
    ///
    /// Returns the number of children removed.
    pub async fn run_cleanup_pass(&self) -> Result<usize, InjectorError> {
        let containers = self.lister.list().await?;
        let present: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();

        let stale: Vec<(String, Uuid)> = self
            .children()
            .into_iter()
            .filter(|(container_id, _)| !present.contains(container_id.as_str()))
            .collect();

        let mut removed = 0;
        for (container_id, agent_id) in stale {
            info!(container_id = %container_id, agent_id = %agent_id, "Deleting child agent");

            match self.directory.delete_child_agent(agent_id).await {
                // Already gone from the directory counts as confirmed.
                Ok(()) | Err(DirectoryError::NotFound(_)) => {
                    self.children
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&container_id);
                    removed += 1;
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, "Failed to delete child agent: {}", e);
                }
            }
        }

        Ok(removed)
    }

    fn is_injected(&self, container_id: &str) -> bool {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(container_id)
    }

    async fn inject(
        &self,
        container: &SubEnvironment,
        directory: &str,
        payload: &Path,
    ) -> Result<Uuid, InjectorError> {
        let created = self
            .directory
            .create_child_agent(&container.friendly_name, directory)
            .await?;

        if let Err(e) = self.launch(&container.id, &created, payload).await {
            if let Err(del) = self.directory.delete_child_agent(created.id).await {
                warn!(agent_id = %created.id, "Failed to remove child after failed launch: {}", del);
            }
            return Err(e);
        }

        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container.id.clone(), created.id);
        Ok(created.id)
    }

    async fn launch(
        &self,
        container_id: &str,
        created: &CreatedChildAgent,
        payload: &Path,
    ) -> Result<(), InjectorError> {
        let dest = self.config.payload_dest.as_str();

        debug!(container_id = %container_id, dest = %dest, "Copying agent binary");
        let output = self.runtime.copy_into(container_id, payload, dest).await?;
        log_output(container_id, &output);

        debug!(container_id = %container_id, "Marking agent binary executable");
        let chmod = ["chmod", "+x", dest].map(String::from);
        let output = self.runtime.exec(container_id, &chmod).await?;
        log_output(container_id, &output);

        debug!(container_id = %container_id, "Launching agent");
        let env = vec![
            (AGENT_URL_ENV.to_string(), self.config.access_url.clone()),
            (AGENT_AUTH_ENV.to_string(), "token".to_string()),
            (AGENT_TOKEN_ENV.to_string(), created.auth_token.to_string()),
        ];
        let argv = [dest, "agent"].map(String::from);
        let output = self.runtime.exec_detached(container_id, &env, &argv).await?;
        log_output(container_id, &output);

        Ok(())
    }
}

fn log_output(container_id: &str, output: &ExecOutput) {
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        debug!(container_id = %container_id, "{}", stdout);
    }
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        warn!(container_id = %container_id, "{}", stderr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_registry::AgentRegistry;
    use crate::bootstrap::FileBootstrap;
    use crate::directory::{InMemoryAgentDirectory, MockAgentDirectory};
    use crate::runtime::{MockContainerRuntime, MockSubEnvironmentLister};
    use agentlink_proto::Agent;
    use async_trait::async_trait;

    /// Container listing the test can edit between ticks
    #[derive(Default)]
    struct FakeLister {
        containers: Mutex<Vec<SubEnvironment>>,
    }

    impl FakeLister {
        fn set(&self, containers: Vec<SubEnvironment>) {
            *self.containers.lock().unwrap() = containers;
        }
    }

    #[async_trait]
    impl SubEnvironmentLister for FakeLister {
        async fn list(&self) -> Result<Vec<SubEnvironment>, RuntimeError> {
            Ok(self.containers.lock().unwrap().clone())
        }
    }

    /// Runtime that records every call and always succeeds
    #[derive(Default)]
    struct RecordingRuntime {
        calls: Mutex<Vec<String>>,
        launches: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn copy_into(
            &self,
            container_id: &str,
            _source: &Path,
            dest: &str,
        ) -> Result<ExecOutput, RuntimeError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("cp {}:{}", container_id, dest));
            Ok(ExecOutput::default())
        }

        async fn exec(
            &self,
            container_id: &str,
            argv: &[String],
        ) -> Result<ExecOutput, RuntimeError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("exec {} {}", container_id, argv.join(" ")));
            Ok(ExecOutput::default())
        }

        async fn exec_detached(
            &self,
            container_id: &str,
            env: &[(String, String)],
            argv: &[String],
        ) -> Result<ExecOutput, RuntimeError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("detach {} {}", container_id, argv.join(" ")));
            self.launches
                .lock()
                .unwrap()
                .push((container_id.to_string(), env.to_vec()));
            Ok(ExecOutput::default())
        }
    }

    fn workspace_container(id: &str, name: &str) -> SubEnvironment {
        SubEnvironment::new(id, name).with_label(WORKSPACE_DIRECTORY_LABEL, "/home/user")
    }

    fn in_memory_directory() -> InMemoryAgentDirectory {
        let registry = AgentRegistry::new();
        let parent = Agent::root(Uuid::new_v4(), "main", Uuid::new_v4());
        let parent_id = parent.id;
        registry.register(parent).unwrap();
        InMemoryAgentDirectory::new(registry, parent_id)
    }

    fn injector(
        directory: Arc<dyn AgentDirectory>,
        lister: Arc<dyn SubEnvironmentLister>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Injector {
        let config = InjectorConfig {
            access_url: "https://control.example.com/".to_string(),
            ..Default::default()
        };
        Injector::new(
            config,
            directory,
            lister,
            runtime,
            Arc::new(FileBootstrap::new("/nonexistent/agentlink-agent")),
        )
    }

    // ============================================================================
    // Reconciliation
    // ============================================================================

    #[tokio::test]
    async fn test_inject_then_noop_then_cleanup() {
        let directory = Arc::new(in_memory_directory());
        let lister = Arc::new(FakeLister::default());
        let runtime = Arc::new(RecordingRuntime::default());
        let injector = injector(directory.clone(), lister.clone(), runtime.clone());
        let payload = Path::new("/cache/agentlink-agent");

        lister.set(vec![workspace_container("c1", "ws-1")]);

        // First tick: one child created and launched
        injector.tick(payload).await;
        let children = injector.children();
        assert_eq!(children.len(), 1);
        let agent_id = children["c1"];
        assert_eq!(directory.list_child_agents().await.unwrap().len(), 1);
        assert_eq!(
            directory.get_agent(agent_id).await.unwrap().directory,
            "/home/user"
        );

        let launches = runtime.launches.lock().unwrap().clone();
        assert_eq!(launches.len(), 1);
        let env: HashMap<_, _> = launches[0].1.iter().cloned().collect();
        assert_eq!(env[AGENT_URL_ENV], "https://control.example.com/");
        assert_eq!(env[AGENT_AUTH_ENV], "token");
        assert!(Uuid::parse_str(&env[AGENT_TOKEN_ENV]).is_ok());

        // Second tick: nothing new
        injector.tick(payload).await;
        assert_eq!(injector.children().len(), 1);
        assert_eq!(runtime.launches.lock().unwrap().len(), 1);

        // Container removed: child deleted within one tick
        lister.set(vec![]);
        injector.tick(payload).await;
        assert!(injector.children().is_empty());
        assert!(directory.list_child_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_sequence_uses_payload_dest() {
        let directory = Arc::new(in_memory_directory());
        let lister = Arc::new(FakeLister::default());
        let runtime = Arc::new(RecordingRuntime::default());
        let injector = injector(directory, lister.clone(), runtime.clone());

        lister.set(vec![workspace_container("c1", "ws-1")]);
        injector
            .run_injection_pass(Path::new("/cache/agent"))
            .await
            .unwrap();

        let calls = runtime.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "cp c1:/tmp/agentlink-agent".to_string(),
                "exec c1 chmod +x /tmp/agentlink-agent".to_string(),
                "detach c1 /tmp/agentlink-agent agent".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unlabeled_containers_are_skipped() {
        let directory = Arc::new(in_memory_directory());
        let lister = Arc::new(FakeLister::default());
        let runtime = Arc::new(RecordingRuntime::default());
        let injector = injector(directory.clone(), lister.clone(), runtime.clone());

        lister.set(vec![
            SubEnvironment::new("c1", "db"),
            SubEnvironment::new("c2", "cache").with_label(WORKSPACE_DIRECTORY_LABEL, ""),
        ]);

        for _ in 0..3 {
            injector.tick(Path::new("/cache/agent")).await;
        }

        assert!(injector.children().is_empty());
        assert!(directory.list_child_agents().await.unwrap().is_empty());
        assert!(runtime.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_launch_deletes_child_and_retries() {
        let directory = Arc::new(in_memory_directory());
        let lister = Arc::new(FakeLister::default());
        lister.set(vec![workspace_container("c1", "ws-1")]);

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_copy_into()
            .returning(|_, _, _| Ok(ExecOutput::default()));
        runtime.expect_exec().returning(|_, _| {
            Err(RuntimeError::CommandFailed {
                command: "docker container exec".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "no such container".to_string(),
            })
        });

        let injector = injector(directory.clone(), lister, Arc::new(runtime));
        let injected = injector
            .run_injection_pass(Path::new("/cache/agent"))
            .await
            .unwrap();

        assert_eq!(injected, 0);
        assert!(injector.children().is_empty());
        assert!(directory.list_child_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_pass_only() {
        let mut lister = MockSubEnvironmentLister::new();
        lister.expect_list().returning(|| {
            Err(RuntimeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "docker not found",
            )))
        });

        let directory = Arc::new(in_memory_directory());
        let injector = injector(
            directory,
            Arc::new(lister),
            Arc::new(RecordingRuntime::default()),
        );

        assert!(injector
            .run_injection_pass(Path::new("/cache/agent"))
            .await
            .is_err());
        assert!(injector.run_cleanup_pass().await.is_err());

        // tick swallows both failures
        injector.tick(Path::new("/cache/agent")).await;
        assert!(injector.children().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_mapping() {
        let lister = Arc::new(FakeLister::default());
        lister.set(vec![workspace_container("c1", "ws-1")]);

        let child_id = Uuid::new_v4();
        let mut directory = MockAgentDirectory::new();
        directory
            .expect_create_child_agent()
            .times(1)
            .returning(move |_, _| {
                Ok(CreatedChildAgent {
                    id: child_id,
                    auth_token: Uuid::new_v4(),
                })
            });
        directory
            .expect_delete_child_agent()
            .returning(|_| Err(DirectoryError::Unavailable("timeout".to_string())));

        let injector = injector(
            Arc::new(directory),
            lister.clone(),
            Arc::new(RecordingRuntime::default()),
        );

        injector
            .run_injection_pass(Path::new("/cache/agent"))
            .await
            .unwrap();
        assert_eq!(injector.children()["c1"], child_id);

        lister.set(vec![]);
        let removed = injector.run_cleanup_pass().await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(injector.children()["c1"], child_id);
    }

    #[tokio::test]
    async fn test_populate_children_matches_by_name() {
        let directory = Arc::new(in_memory_directory());
        let existing = directory.create_child_agent("ws-1", "/w").await.unwrap();
        directory.create_child_agent("orphan", "/w").await.unwrap();

        let lister = Arc::new(FakeLister::default());
        lister.set(vec![
            workspace_container("c1", "ws-1"),
            workspace_container("c2", "ws-2"),
        ]);
        let runtime = Arc::new(RecordingRuntime::default());
        let injector = injector(directory.clone(), lister, runtime.clone());

        assert_eq!(injector.populate_children().await.unwrap(), 1);
        assert_eq!(injector.children()["c1"], existing.id);

        // Only the unmatched container is injected
        injector
            .run_injection_pass(Path::new("/cache/agent"))
            .await
            .unwrap();
        let launches = runtime.launches.lock().unwrap().clone();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].0, "c2");
    }

    // ============================================================================
    // Loop lifecycle
    // ============================================================================

    #[tokio::test]
    async fn test_start_fails_without_payload() {
        let directory = Arc::new(in_memory_directory());
        let injector = Arc::new(injector(
            directory,
            Arc::new(FakeLister::default()),
            Arc::new(RecordingRuntime::default()),
        ));

        let result = injector.start(CancellationToken::new()).await;
        assert!(matches!(result, Err(InjectorError::Bootstrap(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_loop_injects_and_stops_on_cancel() {
        let payload = tempfile::NamedTempFile::new().unwrap();
        let directory = Arc::new(in_memory_directory());
        let lister = Arc::new(FakeLister::default());
        lister.set(vec![workspace_container("c1", "ws-1")]);

        let config = InjectorConfig {
            interval: Duration::from_millis(20),
            ..Default::default()
        };
        let injector = Arc::new(Injector::new(
            config,
            directory.clone(),
            lister,
            Arc::new(RecordingRuntime::default()),
            Arc::new(FileBootstrap::new(payload.path())),
        ));

        let cancel = CancellationToken::new();
        let handle = injector.clone().start(cancel.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while injector.children().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("child should be injected");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .unwrap();
    }
}
