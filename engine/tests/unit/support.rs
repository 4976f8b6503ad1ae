//! Shared fixtures

use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use zippd::app::options::AppOptions;
use zippd::app::state::AppState;
use zippd::deploy::coordinator::{self, DeploymentCoordinator};
use zippd::deploy::docker::testing::FakeRuntime;
use zippd::deploy::fsm::DeploymentStatus;
use zippd::deploy::git::GitCloner;
use zippd::deploy::orchestrator::{self, ContainerOrchestrator};
use zippd::deploy::ports::{self, PortAllocator, PortProbe, PortRange};
use zippd::deploy::routing::PublicRouter;
use zippd::deploy::source::SourceAcquirer;
use zippd::errors::EngineError;
use zippd::models::deployment::Deployment;
use zippd::storage::layout::StorageLayout;
use zippd::storage::records::MemoryRecordStore;

/// Probe that never sees a listener
pub struct ClosedProbe;

#[async_trait]
impl PortProbe for ClosedProbe {
    async fn is_listening(&self, _port: u16) -> bool {
        false
    }
}

/// Router that records calls and can be told to refuse provisioning
#[derive(Default)]
pub struct RecordingRouter {
    pub refuse: bool,
    pub provisioned: Mutex<Vec<(String, u16)>>,
    pub withdrawn: Mutex<Vec<String>>,
}

impl RecordingRouter {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PublicRouter for RecordingRouter {
    async fn provision(&self, deployment_id: &str, external_port: u16) -> Result<String, EngineError> {
        if self.refuse {
            return Err(EngineError::RuntimeError("proxy unavailable".to_string()));
        }
        self.provisioned
            .lock()
            .unwrap()
            .push((deployment_id.to_string(), external_port));
        Ok(format!("https://{}.apps.example.com", deployment_id))
    }

    async fn withdraw(&self, deployment_id: &str) -> Result<(), EngineError> {
        self.withdrawn.lock().unwrap().push(deployment_id.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub layout: StorageLayout,
    pub runtime: Arc<FakeRuntime>,
    pub coordinator: Arc<DeploymentCoordinator>,
}

impl Harness {
    pub async fn new(start: u16, end: u16) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());
        layout.setup().await.unwrap();

        let mut options = AppOptions {
            layout: layout.clone(),
            ..Default::default()
        };
        options.ports.range = PortRange::new(start, end).unwrap();
        options.orchestrator.start_grace = Duration::ZERO;
        options.coordinator.uploads_dir = layout.uploads_dir().path().to_path_buf();

        let runtime = Arc::new(FakeRuntime::new());
        let state = AppState::assemble(
            &options,
            runtime.clone(),
            Arc::new(ClosedProbe),
            Arc::new(MemoryRecordStore::new()),
        );

        Self {
            tmp,
            layout,
            runtime,
            coordinator: state.coordinator,
        }
    }

    /// Same wiring as `new`, with a public router in front
    pub async fn with_router(start: u16, end: u16, router: Arc<dyn PublicRouter>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());
        layout.setup().await.unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let allocator = Arc::new(PortAllocator::new(
            ports::Options {
                range: PortRange::new(start, end).unwrap(),
                ..Default::default()
            },
            runtime.clone(),
            Arc::new(ClosedProbe),
        ));
        let orchestrator = Arc::new(ContainerOrchestrator::new(
            runtime.clone(),
            allocator,
            orchestrator::Options {
                start_grace: Duration::ZERO,
                ..Default::default()
            },
        ));
        let coordinator = Arc::new(DeploymentCoordinator::new(
            Arc::new(MemoryRecordStore::new()),
            SourceAcquirer::new(layout.clones_dir().path(), GitCloner::default()),
            orchestrator,
            Some(router),
            coordinator::Options {
                public_host: "apps.local".to_string(),
                uploads_dir: layout.uploads_dir().path().to_path_buf(),
                ..Default::default()
            },
        ));

        Self {
            tmp,
            layout,
            runtime,
            coordinator,
        }
    }

    pub async fn deployment(&self, id: &str) -> Deployment {
        self.coordinator.get_deployment(id).await.unwrap().unwrap()
    }

    pub async fn reserved_ports(&self) -> Vec<u16> {
        self.coordinator
            .orchestrator()
            .ports()
            .reserved()
            .await
            .into_iter()
            .map(|r| r.port)
            .collect()
    }

    /// Number of entries left under a storage directory
    pub fn leftovers(&self, dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }
}

/// Build a ZIP archive in memory
pub fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A small node project nested in a single top-level directory
pub fn node_project() -> Vec<u8> {
    zip_archive(&[
        (
            "hello-app/package.json",
            r#"{"name":"hello","dependencies":{"express":"^4.18.0"}}"#,
        ),
        ("hello-app/index.js", "console.log('hello');\n"),
    ])
}

pub fn is_terminal_or_running(status: DeploymentStatus) -> bool {
    status.is_terminal() || status == DeploymentStatus::Running
}
