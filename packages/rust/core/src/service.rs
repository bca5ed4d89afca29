//! One handle over the whole discovery system.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use codelore_shared::{
    AppConfig, Concept, ConceptFilter, PipelineRun, Relationship, RelationshipFilter, Result,
    RunId, Trigger,
};
use codelore_storage::Storage;

use crate::events::{EventBus, Subscription};
use crate::pipeline::{Orchestrator, StatusSnapshot};
use crate::watcher::{Watcher, WatcherState};

/// Orchestrator, watcher, event bus and knowledge queries for one scan root.
pub struct DiscoveryService {
    orchestrator: Orchestrator,
    watcher: Watcher,
    store: Arc<Storage>,
}

impl DiscoveryService {
    /// Open the store named by `config` (creating it if needed) and wire up
    /// the pipeline. Runs left `running` by a previous process are marked
    /// failed.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let db_path = config.db_path();
        let store = Arc::new(Storage::open(&db_path).await?);
        match store.fail_interrupted_runs().await {
            Ok(0) => {}
            Ok(n) => warn!(runs = n, "marked interrupted runs as failed"),
            Err(e) => warn!(error = %e, "could not check for interrupted runs"),
        }
        info!(db = %db_path.display(), "knowledge store opened");
        Self::with_store(config, store)
    }

    /// Wire up the pipeline over an already opened store.
    pub fn with_store(config: &AppConfig, store: Arc<Storage>) -> Result<Self> {
        let events = EventBus::new(config.events.buffer);
        let orchestrator = Orchestrator::from_config(config, Arc::clone(&store), events)?;
        let watcher = Watcher::new(orchestrator.clone(), config.watch.clone());
        Ok(Self {
            orchestrator,
            watcher,
            store,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<Storage> {
        &self.store
    }

    pub async fn start_run(&self, scope: Option<&Path>) -> Result<RunId> {
        self.orchestrator.start_run(scope, Trigger::Manual).await
    }

    pub async fn cancel_run(&self, run_id: &RunId) -> bool {
        self.orchestrator.cancel_run(run_id).await
    }

    pub async fn wait_for(&self, run_id: &RunId) -> Result<PipelineRun> {
        self.orchestrator.wait_for(run_id).await
    }

    pub async fn get_status(&self) -> StatusSnapshot {
        self.orchestrator.get_status().await
    }

    pub fn subscribe(&self) -> Subscription {
        self.events().subscribe()
    }

    pub fn events(&self) -> &EventBus {
        self.orchestrator.events()
    }

    pub async fn get_concepts(&self, filter: &ConceptFilter) -> Result<Vec<Concept>> {
        self.store.get_concepts(filter).await
    }

    pub async fn get_relationships(&self, filter: &RelationshipFilter) -> Result<Vec<Relationship>> {
        self.store.get_relationships(filter).await
    }

    pub async fn list_runs(&self, limit: u32) -> Result<Vec<PipelineRun>> {
        self.store.list_runs(limit).await
    }

    pub async fn enable_auto_evolve(&self) -> Result<()> {
        self.watcher.enable_auto_evolve().await
    }

    pub async fn disable_auto_evolve(&self) {
        self.watcher.disable_auto_evolve().await
    }

    pub fn watcher_state(&self) -> WatcherState {
        self.watcher.state()
    }

    /// Stop watching and wait for any active run to finish.
    pub async fn shutdown(&self) {
        self.watcher.disable_auto_evolve().await;
        let status = self.orchestrator.get_status().await;
        if let (true, Some(run_id)) = (status.state.is_active(), status.run_id) {
            if let Err(e) = self.orchestrator.wait_for(&run_id).await {
                warn!(%run_id, error = %e, "active run did not finish cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelore_shared::RunStatus;

    #[tokio::test]
    async fn open_run_and_query() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("agent.py"),
            "from mcp import Client\n\nclass PlannerAgent(BaseAgent):\n    async def run(self):\n        await self.llm.chat()\n",
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.scan.root = dir.path().to_string_lossy().into_owned();
        let service = DiscoveryService::open(&config).await.unwrap();
        assert!(config.db_path().exists());

        let run_id = service.start_run(None).await.unwrap();
        let run = service.wait_for(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let concepts = service.get_concepts(&ConceptFilter::default()).await.unwrap();
        assert!(concepts.iter().any(|c| c.name == "module:agent"));
        let runs = service.list_runs(5).await.unwrap();
        assert_eq!(runs[0].run_id, run_id);

        let status = service.get_status().await;
        assert_eq!(status.run_id, Some(run_id));
        assert!(!status.state.is_active());
    }

    #[tokio::test]
    async fn auto_evolve_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.scan.root = dir.path().to_string_lossy().into_owned();
        let service = DiscoveryService::open(&config).await.unwrap();

        assert_eq!(service.watcher_state(), WatcherState::Disabled);
        service.enable_auto_evolve().await.unwrap();
        assert_eq!(service.watcher_state(), WatcherState::Enabled);
        service.shutdown().await;
        assert_eq!(service.watcher_state(), WatcherState::Disabled);
    }
}
