//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::coordinator::DeploymentCoordinator;
use crate::deploy::docker::{ContainerRuntime, DockerCli};
use crate::deploy::git::GitCloner;
use crate::deploy::orchestrator::ContainerOrchestrator;
use crate::deploy::ports::{PortAllocator, PortProbe, TcpProbe};
use crate::deploy::source::SourceAcquirer;
use crate::errors::EngineError;
use crate::storage::records::{MemoryRecordStore, RecordStore};

/// Main application state
pub struct AppState {
    pub coordinator: Arc<DeploymentCoordinator>,
}

impl AppState {
    /// Initialize application state against the local docker daemon
    pub async fn init(options: &AppOptions) -> Result<Self, EngineError> {
        info!("Initializing application state...");

        options.layout.setup().await?;
        let store = MemoryRecordStore::persistent(options.layout.records_file()).await?;

        Ok(Self::assemble(
            options,
            Arc::new(DockerCli::new(&options.docker_bin)),
            Arc::new(TcpProbe::new("127.0.0.1", options.probe_timeout)),
            Arc::new(store),
        ))
    }

    /// Wire the engine components around the given collaborators
    pub fn assemble(
        options: &AppOptions,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn PortProbe>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let ports = Arc::new(PortAllocator::new(
            options.ports.clone(),
            runtime.clone(),
            probe,
        ));
        let orchestrator = Arc::new(ContainerOrchestrator::new(
            runtime,
            ports,
            options.orchestrator.clone(),
        ));
        let acquirer = SourceAcquirer::new(
            options.layout.clones_dir().path(),
            GitCloner::new(&options.git_bin),
        );

        let coordinator = Arc::new(DeploymentCoordinator::new(
            store,
            acquirer,
            orchestrator,
            None,
            options.coordinator.clone(),
        ));

        Self { coordinator }
    }
}
